use crate::error::Error;
use std::convert::TryFrom;
use std::io;
use std::str::FromStr;

/// Engine configuration, parsed from TOML at load time.
///
/// Lookups are typed for the settings the engine reads: counts and timers
/// (`get_usize`/`get_u32`), switches (`get_bool`), names (`get_str`), and
/// the per-protocol tables of the flow cache (`get_proto_usize`). Dotted
/// keys descend one table per dot. A missing key is `None`; defaults live
/// with the callers.
pub struct Config {
    root: toml::Value,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            root: toml::Value::Table(toml::map::Map::new()),
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Config, Error> {
        match raw.parse::<toml::Value>() {
            Ok(root) => Ok(Config { root }),
            Err(e) => Err(Error::Config(e.to_string())),
        }
    }
}

impl Config {
    /// Parse a configuration from a reader
    pub fn load<R: io::Read>(mut input: R) -> Result<Config, Error> {
        let mut raw = String::new();
        input.read_to_string(&mut raw)?;
        let config = raw.parse()?;
        debug!("configuration loaded");
        Ok(config)
    }

    fn lookup(&self, path: &str) -> Option<&toml::Value> {
        path.split('.')
            .try_fold(&self.root, |value, key| value.get(key))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path)?.as_str()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.lookup(path)?.as_bool()
    }

    /// Non-negative integer entry (counts, pool sizes)
    pub fn get_usize(&self, path: &str) -> Option<usize> {
        self.lookup(path)?
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
    }

    /// Timer / id entry; rejects values that do not fit
    pub fn get_u32(&self, path: &str) -> Option<u32> {
        self.lookup(path)?
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Entry in a per-protocol table, `<table>.<proto>.<key>`
    /// (e.g. `flow.tcp.nominal_timeout`).
    pub fn get_proto_usize(&self, table: &str, proto: &str, key: &str) -> Option<usize> {
        self.root
            .get(table)?
            .get(proto)?
            .get(key)?
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
    }
}
