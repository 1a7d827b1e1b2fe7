fn main() {
    if let Err(err) = marketload::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
