use crate::{
    config::{datadir_path, Config, ConfigError},
    db::{
        sources::{BlockSourceIndex, NoSourceIndex, SourceIndex},
        DbError,
    },
};

use std::{fs, os::unix::fs::DirBuilderExt, path::PathBuf};

pub struct PoolD {
    pub data_dir: PathBuf,
    pub log_to_file: bool,
    pub payment_sources: Option<PathBuf>,
}

fn create_datadir(datadir_path: &PathBuf) -> Result<(), std::io::Error> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700).recursive(true).create(datadir_path)
}

impl PoolD {
    pub fn from_config(config: Config) -> Result<PoolD, Box<dyn std::error::Error>> {
        let mut data_dir = match config.data_dir {
            Some(data_dir) => data_dir,
            None => datadir_path()?,
        };
        if !data_dir.as_path().exists() {
            if let Err(e) = create_datadir(&data_dir) {
                return Err(Box::from(ConfigError(format!(
                    "Could not create data dir '{:?}': {}.",
                    data_dir, e
                ))));
            }
        }
        data_dir = fs::canonicalize(data_dir)?;

        Ok(PoolD {
            data_dir,
            log_to_file: config.log_to_file.unwrap_or(false),
            payment_sources: config.payment_sources,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        let mut path = self.data_dir.clone();
        path.push(file_name);
        path
    }

    pub fn db_path(&self) -> PathBuf {
        self.file_from_datadir("pool.db")
    }

    pub fn log_file(&self) -> PathBuf {
        self.file_from_datadir("log")
    }

    /// Where to look up the source of payments recorded without one.
    pub fn source_index(&self) -> Result<Box<dyn SourceIndex>, DbError> {
        match self.payment_sources {
            Some(ref path) => {
                let index = BlockSourceIndex::from_file(path)?;
                log::info!(
                    "Loaded the source of {} block(s) from '{}'",
                    index.len(),
                    path.display()
                );
                Ok(Box::new(index))
            }
            None => Ok(Box::new(NoSourceIndex)),
        }
    }
}
