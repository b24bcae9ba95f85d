//! Schema and question files, read once before a session starts.

use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_SCHEMA_PATH: &str = "table_description.txt";
pub const DEFAULT_QUESTION_PATH: &str = "question.txt";

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("input file not found: {}", path.display())]
    MissingFile { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read a text input. The content is passed through verbatim apart from
/// trailing whitespace.
pub fn read_input_file(path: impl AsRef<Path>) -> Result<String, InputError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.trim_end().to_string()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(InputError::MissingFile {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(InputError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
