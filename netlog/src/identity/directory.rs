use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    net::Ipv4Addr,
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use super::{BackendError, IdentityDirectory};

/// Floating-IP directory backed by a fixed table.
///
/// The file format is one `<ipv4> <identifier>` pair per line, where the
/// identifier is `<namespace>-<name>`. `#` starts a comment.
#[derive(Debug)]
pub struct StaticDirectory {
    entries: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(ip, identifier)| (ip.to_string(), identifier.to_string()))
                .collect(),
        }
    }

    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::empty()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open identity directory at {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut entries = HashMap::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read line {} of {}", line_no + 1, path.display())
            })?;
            let trimmed = line.split('#').next().unwrap_or("").trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let (addr, identifier) = match (fields.next(), fields.next(), fields.next()) {
                (Some(addr), Some(identifier), None) => (addr, identifier),
                _ => {
                    return Err(anyhow!(
                        "line {} of {} must be '<ipv4> <namespace>-<name>'",
                        line_no + 1,
                        path.display()
                    ))
                }
            };
            let addr: Ipv4Addr = addr.parse().with_context(|| {
                format!(
                    "invalid IPv4 address '{}' on line {} of {}",
                    addr,
                    line_no + 1,
                    path.display()
                )
            })?;
            entries.insert(addr.to_string(), identifier.to_string());
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>, BackendError> {
        Ok(self.entries.get(ip).cloned())
    }
}
