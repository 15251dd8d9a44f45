use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Rewrites credential material before log lines reach the sink.
///
/// Covered: SGX key names (`NEK:<hex>`) and the configured SGX / Ethereum
/// node hosts. Hosts are replaced with stable tokens so lines stay greppable.
pub struct Redactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl Redactor {
    pub fn from_config(config: &Config) -> Self {
        let mut patterns = vec![(Regex::new(r"NEK:\w+").unwrap(), "[SGX_KEY]")];
        if let Some(host) = config.sgx_url.as_ref().and_then(host_pattern) {
            patterns.push((host, "[SGX_IP]"));
        }
        if let Some(host) = host_pattern(&config.endpoint) {
            patterns.push((host, "[ETH_IP]"));
        }
        Self { patterns }
    }

    pub fn scrub(&self, line: &str) -> String {
        let mut out = line.to_string();
        for (pattern, replacement) in &self.patterns {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out
    }
}

fn host_pattern(url: &crate::secret::SecretUrl) -> Option<Regex> {
    let host = url.host_str()?;
    Regex::new(&regex::escape(host)).ok()
}

#[derive(Clone)]
pub struct RedactingWriter {
    redactor: Arc<Redactor>,
}

impl RedactingWriter {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            redactor: Arc::new(redactor),
        }
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter {
    type Writer = RedactingIo;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingIo {
            redactor: self.redactor.clone(),
        }
    }
}

pub struct RedactingIo {
    redactor: Arc<Redactor>,
}

impl Write for RedactingIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let scrubbed = self.redactor.scrub(&line);
        io::stderr().write_all(scrubbed.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::new(Redactor::from_config(config)))
        .init();
}
