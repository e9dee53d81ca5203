#[derive(Debug)]
pub enum HprofRetainError {
    InputFileNotFound { name: String },
    InvalidTopPositiveInt,
    MalformedDump { message: String },
    UnsupportedDump { message: String },
    CapacityExhausted { message: String },
    ClapError { e: clap::Error },
    StdIoError { e: std::io::Error },
}

impl HprofRetainError {
    pub fn malformed(message: impl Into<String>) -> Self {
        HprofRetainError::MalformedDump {
            message: message.into(),
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        HprofRetainError::CapacityExhausted {
            message: message.into(),
        }
    }
}

impl std::convert::From<std::io::Error> for HprofRetainError {
    fn from(e: std::io::Error) -> Self {
        HprofRetainError::StdIoError { e }
    }
}

impl std::convert::From<clap::Error> for HprofRetainError {
    fn from(e: clap::Error) -> Self {
        HprofRetainError::ClapError { e }
    }
}
