use crate::error::{Error, Result};
use crate::types::BucketName;
use serde::Deserialize;

/// Arguments handed to the job script, either as one string or as a list.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Arguments {
    Line(String),
    List(Vec<String>),
}

impl Default for Arguments {
    fn default() -> Self {
        Arguments::List(Vec::new())
    }
}

impl Arguments {
    /// argv for the script. A single string is split on whitespace, no shell quoting applies.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Arguments::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Arguments::List(args) => args.clone(),
        }
    }
}

/// A parsed job description.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    pub script: String,
    #[serde(default)]
    pub arguments: Arguments,
    pub bucket: BucketName,
    #[serde(default)]
    pub files: Vec<String>,
}

impl JobSpec {
    /// Parse a raw message body.
    ///
    /// Anything that is not a well-formed JSON job object, or that names an empty
    /// bucket or an empty file name, is a `Parse` error.
    pub fn parse(raw_body: &str) -> Result<Self> {
        let spec: JobSpec =
            serde_json::from_str(raw_body).map_err(|err| Error::Parse(err.to_string()))?;
        if spec.bucket.trim().is_empty() {
            return Err(Error::Parse("bucket must not be empty".into()));
        }
        if spec.files.iter().any(|f| f.trim().is_empty()) {
            return Err(Error::Parse("file names must not be empty".into()));
        }
        Ok(spec)
    }
}
