use autosnippet::core::error::EngineError;

fn main() {
    if let Err(err) = autosnippet::run() {
        eprintln!("Error: {}", err);
        let code = match err {
            EngineError::Validation(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
