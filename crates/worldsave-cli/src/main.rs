#![forbid(unsafe_code)]

fn main() {
    std::process::exit(worldsave_cli::run());
}
