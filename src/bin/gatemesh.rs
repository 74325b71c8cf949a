fn main() -> std::process::ExitCode {
    gatemesh::cli::main()
}
