mod args;
mod builddb;
mod etc;
mod run;
#[cfg(test)]
mod test;

use clap::Parser;

use args::Command;

fn main() {
    let args = args::Args::parse();
    etc::load_config(&args.config_search_path);
    pretty_env_logger::init();

    let result = match args.command {
        Command::Run { port, workers, locale, contests, testing } => {
            let cfg = {
                let mut cfg = etc::CONFIG.write().expect("config lock poisoned").clone();
                if let Some(port) = port {
                    cfg.addr = format!(":{port}");
                }
                if let Some(workers) = workers {
                    cfg.workers = workers;
                }
                if let Some(locale) = locale {
                    cfg.locale_default = locale;
                }
                if let Some(contests) = contests {
                    cfg.contests = contests;
                }
                cfg.testing = cfg.testing || testing;
                cfg
            };

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to start tokio runtime")
                .block_on(run::run(cfg))
        }
        Command::Builddb { source, output, password, save_pass } => builddb::run(&source, &output, password, save_pass),
    };

    if let Err(e) = result {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
