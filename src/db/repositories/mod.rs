mod sensor_readings;
