use pooldb::{
    config::Config,
    db::{upgrade_db_with_sources, Database},
    poold::PoolD,
};

use std::{env, path::PathBuf, process, str::FromStr};

// No need for complex argument parsing: we only ever accept one, "--conf".
fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args.len() != 3 || args[1] != "--conf" {
        eprintln!("Unknown arguments '{:?}'.", args);
        eprintln!("Only '--conf <configuration file path>' is supported.");
        process::exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

// This creates the log file automagically if it doesn't exist, and logs on stdout
// if None is given
fn setup_logger(
    log_file: Option<&str>,
    log_level: log::LevelFilter,
) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level)
        // The storage engine is chatty at debug level
        .level_for("sled", log::LevelFilter::Info);

    if let Some(log_file) = log_file {
        dispatcher.chain(fern::log_file(log_file)?).apply()?;
    } else {
        dispatcher.chain(std::io::stdout()).apply()?;
    }

    Ok(())
}

// Bring the database to the latest version and check its invariants. Any error here
// must prevent startup.
fn open_db(poold: &PoolD) -> Result<Database, Box<dyn std::error::Error>> {
    let db_path = poold.db_path();
    log::info!("Opening database at '{}'", db_path.display());
    let db = Database::open(&db_path)?;

    if !db.create_buckets()? {
        let sources = poold.source_index()?;
        upgrade_db_with_sources(&db, sources.as_ref())?;
    }
    db.check_invariants()?;

    Ok(db)
}

fn main() {
    let args = env::args().collect();
    let conf_file = parse_args(args);
    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        process::exit(1);
    });
    let log_level = if let Some(ref level) = &config.log_level {
        log::LevelFilter::from_str(level.as_str()).unwrap_or_else(|e| {
            eprintln!("Invalid log level: {}", e);
            process::exit(1);
        })
    } else {
        log::LevelFilter::Info
    };
    let poold = PoolD::from_config(config).unwrap_or_else(|e| {
        eprintln!("Error creating global state: {}", e);
        process::exit(1);
    });

    let log_file = poold.log_file();
    let log_output = if poold.log_to_file {
        Some(log_file.to_str().unwrap_or_else(|| {
            eprintln!("Log file path '{:?}' is not valid unicode", log_file);
            process::exit(1);
        }))
    } else {
        None
    };
    setup_logger(log_output, log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    let db = open_db(&poold).unwrap_or_else(|e| {
        log::error!("Error opening database: {}", e);
        eprintln!("Error opening database: {}", e);
        process::exit(1);
    });
    let version = db.fetch_version().unwrap_or_else(|e| {
        log::error!("Error reading database version: {}", e);
        process::exit(1);
    });
    println!(
        "Pool database at '{}' is ready (version {})",
        poold.db_path().display(),
        version
    );

    db.close().unwrap_or_else(|e| {
        log::error!("Error closing database: {}", e);
        process::exit(1);
    });
}
