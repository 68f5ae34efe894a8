fn main() -> std::process::ExitCode {
    rtl433_logger::run()
}
