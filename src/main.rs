fn main() {
    if let Err(err) = extsort::cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
