use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    serial::{codecs::lines::LinesCodec, serial_port::FlowControl},
    validation::RuleSet,
};

/// The configuration used for running sessions and the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Baud rate used when none is given.
    pub default_baud_rate: u32,

    /// Device output is split into lines at this character.
    /// Must be ASCII.
    pub read_delimiter: char,

    /// If set, appended to everything written to the device.
    /// Must be ASCII.
    pub write_delimiter: Option<char>,

    /// How many messages a subscriber may lag behind before losing some.
    pub event_capacity: usize,

    /// Devices whose path contains any of these are not listed.
    pub skip_ports: Vec<String>,

    /// Flow control for native serial ports.
    pub flow_control: FlowControl,

    /// Validation rules.
    /// Takes precedence over `rules_path`.
    pub rules: Option<RuleSet>,

    /// A .ron file with validation rules.
    /// If neither this nor `rules` is given, the default rules are used.
    pub rules_path: Option<PathBuf>,

    /// The port the server listens on.
    pub server_port: u16,

    /// If set, logs are also written to a daily rolling file in this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_baud_rate: 115_200,
            read_delimiter: '\n',
            write_delimiter: None,
            event_capacity: 1024,
            skip_ports: vec![],
            flow_control: FlowControl::None,
            rules: None,
            rules_path: None,
            server_port: 3123,
            log_dir: None,
        }
    }
}

/// The largest capacity a broadcast channel supports.
const MAX_EVENT_CAPACITY: usize = usize::MAX / 2;

fn ascii_byte(what: &str, c: char) -> Result<u8, Error> {
    if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(Error::BadConfig(format!(
            "The {what} must be an ASCII character, got {c:?}"
        )))
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Fields not given take their default values.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            write_delimiter: Some('\n'),
            skip_ports: vec!["/dev/ttyS".into(), "Bluetooth".into()],
            rules_path: Some("rules.ron".into()),
            log_dir: Some("logs".into()),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Internal(format!("Could not serialize configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            Error::BadConfig(format!(
                "Could not read configuration at {}: {e}",
                path.display()
            ))
        })?;

        Self::deserialize(&s)
    }

    /// The codec sessions use to split and write lines.
    pub(crate) fn lines_codec(&self) -> Result<LinesCodec, Error> {
        let read = ascii_byte("read delimiter", self.read_delimiter)?;
        let write = self
            .write_delimiter
            .map(|c| ascii_byte("write delimiter", c))
            .transpose()?;

        Ok(LinesCodec::new(read, write))
    }

    /// The validation rules in effect.
    pub fn rule_set(&self) -> Result<RuleSet, Error> {
        let rules = match (&self.rules, &self.rules_path) {
            (Some(rules), _) => rules.clone(),
            (None, Some(path)) => RuleSet::new_from_path(path)?,
            (None, None) => RuleSet::default(),
        };
        rules.check()?;

        Ok(rules)
    }

    fn check_numbers(&self) -> Result<(), Error> {
        if self.default_baud_rate == 0 {
            return Err(Error::BadConfig(
                "The default baud rate must be above zero".into(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(Error::BadConfig(
                "The event capacity must be above zero, subscribers need room for at least one message".into(),
            ));
        }

        if self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(Error::BadConfig(format!(
                "The event capacity must be at most {MAX_EVENT_CAPACITY}, got {}",
                self.event_capacity
            )));
        }

        Ok(())
    }

    fn check_skip_ports(&self) -> Result<(), Error> {
        match self.skip_ports.iter().position(|pattern| pattern.is_empty()) {
            Some(index) => Err(Error::BadConfig(format!(
                "The skip pattern with index {index} (zero indexed) is empty, which would skip every port"
            ))),
            None => Ok(()),
        }
    }

    /// Check that the configuration makes sense.
    ///
    /// Inline rules are checked, rules in a file are checked when loaded.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_numbers()?;
        self.lines_codec()?;
        self.check_skip_ports()?;

        if let Some(rules) = &self.rules {
            rules.check()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty().unwrap());
    }

    #[test]
    fn example_survives_ron() {
        let c = Config::example();

        let again = Config::deserialize(&c.serialize_pretty().unwrap()).unwrap();

        assert_eq!(c, again);
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    default_baud_rate: 420000,
    write_delimiter: '\r',
    skip_ports: ["/dev/ttyS"],
    flow_control: Hardware,
    rules: (
        categories: [
            (
                name: "2.4 GHz",
                keys: ["REGULATORY_DOMAIN_ISM_2400", "REGULATORY_DOMAIN_EU_CE_2400"],
            ),
        ],
        min_lengths: [],
        non_empty: [],
    ),
    server_port: 8080,
)
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.default_baud_rate, 420_000);
        assert_eq!(config.write_delimiter, Some('\r'));
        assert_eq!(config.flow_control, FlowControl::Hardware);
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.rule_set().unwrap().categories.len(), 1);

        // Not given, so defaulted.
        assert_eq!(config.read_delimiter, '\n');
        assert_eq!(config.event_capacity, 1024);

        config.validate().unwrap();
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::deserialize("()").unwrap(), Config::default());
    }

    #[test]
    fn default_rules_when_none_given() {
        assert_eq!(Config::default().rule_set().unwrap(), RuleSet::default());
    }

    #[test]
    fn bad_config_syntax() {
        assert!(matches!(
            Config::deserialize("(server_port: \"nope\")"),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn bad_config_missing_file() {
        let err = Config::new_from_path("/definitely/not/here.ron")
            .unwrap_err()
            .try_into_bad_config()
            .unwrap();

        assert!(err.contains("/definitely/not/here.ron"));
    }

    #[test]
    fn bad_config_huge_capacity() {
        let c = Config::deserialize(&format!("(event_capacity: {})", usize::MAX)).unwrap();

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("capacity"));
    }

    #[tokio::test]
    async fn session_refuses_huge_capacity() {
        let c = Config {
            event_capacity: usize::MAX / 2 + 1,
            ..Default::default()
        };

        let transport = Box::new(crate::mock::MockTransport::new());
        let result = crate::session::SessionHandle::new(transport, &c);

        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[test]
    fn bad_config_zero_capacity() {
        let c = Config {
            event_capacity: 0,
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("capacity"));
    }

    #[test]
    fn bad_config_zero_baud() {
        let c = Config {
            default_baud_rate: 0,
            ..Default::default()
        };

        assert!(matches!(c.validate(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn bad_config_delimiter() {
        let c = Config {
            read_delimiter: 'ø',
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("read delimiter"));
    }

    #[test]
    fn bad_config_empty_skip_pattern() {
        let c = Config {
            skip_ports: vec!["ttyS".into(), "".into()],
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();

        // Error message countains the index of the bad pattern
        assert!(err.contains("index 1"));
    }

    #[test]
    fn bad_config_inline_rules() {
        let mut rules = RuleSet::default();
        rules.categories[0].keys.clear();

        let c = Config {
            rules: Some(rules),
            ..Default::default()
        };

        assert!(matches!(c.validate(), Err(Error::BadConfig(_))));
    }
}
