use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ROM read error: {0}")]
    Rom(String),

    #[error("Could not open output file {0} for writing")]
    OutputOpen(String),

    #[error("Unsupported module: {0}")]
    Unsupported(String),

    #[error("Instrument-based module but no instrument list was supplied")]
    MissingInstruments,

    #[error("Module uses {0} instruments, which does not fit the output format")]
    TooManyInstruments(usize),

    #[error("Module uses {0} samples, which does not fit the output format")]
    TooManySamples(usize),

    #[error("Could not find the Krawall data tables in the ROM")]
    OffsetsNotFound,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit code for this error, matching the classic tool:
    /// 2 = input/output file trouble, 3 = offsets/unsupported, 10 = too many
    /// instruments or samples.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::OutputOpen(_) | Error::Io(_) => 2,
            Error::Rom(_)
            | Error::Unsupported(_)
            | Error::MissingInstruments
            | Error::OffsetsNotFound => 3,
            Error::TooManyInstruments(_) | Error::TooManySamples(_) => 10,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
