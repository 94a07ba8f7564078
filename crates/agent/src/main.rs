#![forbid(unsafe_code)]

mod cli;
mod signals;
mod startup;

use infrastructure::constants::APP_NAME;
use infrastructure::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = cli::parse();

    if cli.version {
        println!("{APP_NAME} {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_logging(cli.log_level, cli.log_format);

    let code = startup::run(&cli).await;
    if code != 0 {
        std::process::exit(code);
    }
}
