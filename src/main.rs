fn main() {
    if let Err(err) = llmcommit::run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
