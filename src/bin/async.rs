use kasa_recorder::{logger::setup_logger, tokio::discovery};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = setup_logger("info") {
        eprintln!("could not set up logging: {}", err);
    }

    match discovery::discover().await {
        Ok(devices) => {
            for (addr, response) in devices {
                let alias = response
                    .sysinfo()
                    .map(|sysinfo| sysinfo.alias.clone())
                    .unwrap_or_default();
                println!("{}\t{}", addr, alias);
            }
        }
        Err(err) => {
            eprintln!("discovery failed: {}", err);
            std::process::exit(1);
        }
    }
}
