//! Checking firmware build options ("user defines") before they are used.
//!
//! Rules are data: a [`RuleSet`] lists categories of mutually required keys,
//! minimum value lengths, and values which may not be empty.
//! Validating never fails, problems are returned as a list of [`ValidationFailure`]s.

use std::{fmt::Display, path::Path};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

macro_rules! user_define_keys {
    ($($(#[$meta:meta])* $variant:ident => $name:literal,)+) => {
        /// The key of a build option.
        ///
        /// Keys not known here are kept as [`UserDefineKey::Other`], and no rule applies to them.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum UserDefineKey {
            $(
                $(#[$meta])*
                $variant,
            )+

            /// A key not recognized.
            Other(String),
        }

        impl UserDefineKey {
            /// The name of the key as used by the firmware build.
            pub fn as_str(&self) -> &str {
                match self {
                    $(UserDefineKey::$variant => $name,)+
                    UserDefineKey::Other(name) => name,
                }
            }

            /// Whether this is one of the known keys.
            pub fn is_recognized(&self) -> bool {
                !matches!(self, UserDefineKey::Other(_))
            }
        }

        impl From<&str> for UserDefineKey {
            fn from(name: &str) -> Self {
                match name {
                    $($name => UserDefineKey::$variant,)+
                    other => UserDefineKey::Other(other.to_owned()),
                }
            }
        }
    };
}

user_define_keys! {
    /// 433 MHz, Australia.
    RegulatoryDomainAu433 => "REGULATORY_DOMAIN_AU_433",
    /// 433 MHz, Europe.
    RegulatoryDomainEu433 => "REGULATORY_DOMAIN_EU_433",
    /// 915 MHz, Australia.
    RegulatoryDomainAu915 => "REGULATORY_DOMAIN_AU_915",
    /// 868 MHz, Europe.
    RegulatoryDomainEu868 => "REGULATORY_DOMAIN_EU_868",
    /// 866 MHz, India.
    RegulatoryDomainIn866 => "REGULATORY_DOMAIN_IN_866",
    /// 915 MHz, FCC.
    RegulatoryDomainFcc915 => "REGULATORY_DOMAIN_FCC_915",
    /// 2.4 GHz, ISM.
    RegulatoryDomainIsm2400 => "REGULATORY_DOMAIN_ISM_2400",
    /// 2.4 GHz, CE (LBT).
    RegulatoryDomainEuCe2400 => "REGULATORY_DOMAIN_EU_CE_2400",
    /// Phrase used to bind receiver and transmitter.
    BindingPhrase => "BINDING_PHRASE",
    /// Use the hybrid switch mode with 8 switches.
    HybridSwitches8 => "HYBRID_SWITCHES_8",
    /// Enable telemetry.
    EnableTelemetry => "ENABLE_TELEMETRY",
    /// Telemetry report interval.
    TlmReportIntervalMs => "TLM_REPORT_INTERVAL_MS",
    /// Faster sync on connect.
    FastSync => "FAST_SYNC",
    /// Allow higher output power.
    UnlockHigherPower => "UNLOCK_HIGHER_POWER",
    /// Use a channel to arm.
    ArmChannel => "ARM_CHANNEL",
    /// Disable the beep on startup.
    DisableStartupBeep => "DISABLE_STARTUP_BEEP",
    /// Only beep once on startup.
    JustBeepOnce => "JUST_BEEP_ONCE",
    /// A custom melody to play on startup.
    MyStartupMelody => "MY_STARTUP_MELODY",
    /// Wifi network to join.
    HomeWifiSsid => "HOME_WIFI_SSID",
    /// Password of the wifi network to join.
    HomeWifiPassword => "HOME_WIFI_PASSWORD",
    /// Seconds until wifi starts by itself.
    AutoWifiOnInterval => "AUTO_WIFI_ON_INTERVAL",
    /// Receiver UART baud rate.
    RcvrUartBaud => "RCVR_UART_BAUD",
    /// Invert the receiver TX pin.
    RcvrInvertTx => "RCVR_INVERT_TX",
    /// Lock the receiver to the first bound model.
    LockOnFirstConnection => "LOCK_ON_FIRST_CONNECTION",
    /// Use 500 Hz packet rate.
    Use500Hz => "USE_500HZ",
}

impl From<String> for UserDefineKey {
    fn from(name: String) -> Self {
        name.as_str().into()
    }
}

impl From<UserDefineKey> for String {
    fn from(key: UserDefineKey) -> Self {
        match key {
            UserDefineKey::Other(name) => name,
            recognized => recognized.as_str().to_owned(),
        }
    }
}

impl Display for UserDefineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A build option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDefine {
    /// Which option.
    pub key: UserDefineKey,

    /// Whether the option is turned on.
    pub enabled: bool,

    /// The value, for options which take one.
    #[serde(default)]
    pub value: Option<String>,
}

impl UserDefine {
    /// An option without a value.
    pub fn new<K: Into<UserDefineKey>>(key: K, enabled: bool) -> Self {
        Self {
            key: key.into(),
            enabled,
            value: None,
        }
    }

    /// An option with a value.
    pub fn with_value<K: Into<UserDefineKey>>(key: K, enabled: bool, value: &str) -> Self {
        Self {
            key: key.into(),
            enabled,
            value: Some(value.into()),
        }
    }
}

/// Keys where at least one must be enabled if any of them is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Used in messages.
    pub name: String,

    /// The members.
    pub keys: Vec<UserDefineKey>,
}

/// An enabled option's value must have at least this many characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinLength {
    /// The option.
    pub key: UserDefineKey,

    /// Minimum number of characters.
    pub min_length: usize,

    /// What the option is, in words. Used in messages.
    pub description: String,
}

/// An enabled option's value may not be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonEmpty {
    /// The option.
    pub key: UserDefineKey,

    /// What the option is, in words. Used in messages.
    pub description: String,
}

/// A problem found with a set of options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationFailure {
    /// Options of a category were present, but none were enabled.
    NoneEnabledInCategory {
        /// The category name.
        category: String,
    },

    /// A value was too short.
    TooShort {
        /// The option.
        key: UserDefineKey,

        /// What the option is, in words.
        description: String,

        /// Required number of characters.
        min_length: usize,

        /// The actual number of characters.
        length: usize,
    },

    /// An enabled option had no value.
    Empty {
        /// The option.
        key: UserDefineKey,

        /// What the option is, in words.
        description: String,
    },
}

impl Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::NoneEnabledInCategory { category } => write!(
                f,
                "You must choose regulatory domain for your device in {category} band"
            ),
            ValidationFailure::TooShort {
                description,
                min_length,
                length,
                ..
            } => write!(
                f,
                "{description} must be at least {min_length} characters long (got {length})"
            ),
            ValidationFailure::Empty { description, .. } => {
                write!(f, "{description} selected, but not entered")
            }
        }
    }
}

/// The rules to validate options against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Checked in order.
    pub categories: Vec<Category>,

    /// Minimum value lengths.
    pub min_lengths: Vec<MinLength>,

    /// Values which may not be empty.
    pub non_empty: Vec<NonEmpty>,
}

impl Default for RuleSet {
    fn default() -> Self {
        use UserDefineKey::*;

        Self {
            categories: vec![
                Category {
                    name: "400 Mhz".into(),
                    keys: vec![RegulatoryDomainEu433, RegulatoryDomainAu433],
                },
                Category {
                    name: "900 MHz".into(),
                    keys: vec![
                        RegulatoryDomainAu915,
                        RegulatoryDomainEu868,
                        RegulatoryDomainFcc915,
                        RegulatoryDomainIn866,
                    ],
                },
                Category {
                    name: "2.4 GHz".into(),
                    keys: vec![RegulatoryDomainIsm2400, RegulatoryDomainEuCe2400],
                },
            ],
            min_lengths: vec![MinLength {
                key: BindingPhrase,
                min_length: 6,
                description: "Custom binding phrase".into(),
            }],
            non_empty: vec![NonEmpty {
                key: MyStartupMelody,
                description: "Custom startup melody".into(),
            }],
        }
    }
}

fn first_with_key<'a>(options: &'a [UserDefine], key: &UserDefineKey) -> Option<&'a UserDefine> {
    options.iter().find(|option| &option.key == key)
}

impl RuleSet {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<RuleSet>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse rules: {e}")))
    }

    /// Read rules from a .ron file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            Error::BadConfig(format!("Could not read rules at {}: {e}", path.display()))
        })?;

        Self::deserialize(&s)
    }

    /// Serialize the rules in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Internal(format!("Could not serialize rules: {e}")))
    }

    fn check_categories(&self) -> Result<(), Error> {
        for category in &self.categories {
            if category.keys.is_empty() {
                return Err(Error::BadConfig(format!(
                    "The category `{}` has no keys, it would never apply",
                    category.name
                )));
            }
        }

        let duplicate_names = self
            .categories
            .iter()
            .map(|category| &category.name)
            .duplicates()
            .join(", ");
        if !duplicate_names.is_empty() {
            return Err(Error::BadConfig(format!(
                "Category names must be unique. Duplicates: {duplicate_names}"
            )));
        }

        let shared_keys = self
            .categories
            .iter()
            .flat_map(|category| category.keys.iter().unique())
            .duplicates()
            .join(", ");
        if !shared_keys.is_empty() {
            return Err(Error::BadConfig(format!(
                "A key may only be in one category. Found in several: {shared_keys}"
            )));
        }

        Ok(())
    }

    fn check_min_lengths(&self) -> Result<(), Error> {
        match self.min_lengths.iter().find(|rule| rule.min_length == 0) {
            Some(rule) => Err(Error::BadConfig(format!(
                "The minimum length of `{}` is zero, which always holds",
                rule.key
            ))),
            None => Ok(()),
        }
    }

    /// Check that the rules make sense.
    pub fn check(&self) -> Result<(), Error> {
        self.check_categories()?;
        self.check_min_lengths()?;

        Ok(())
    }

    fn validate_categories<'a>(
        &'a self,
        options: &'a [UserDefine],
    ) -> impl Iterator<Item = ValidationFailure> + 'a {
        self.categories.iter().filter_map(move |category| {
            let (present, enabled) = options
                .iter()
                .filter(|option| category.keys.contains(&option.key))
                .fold((0, 0), |(present, enabled), option| {
                    (present + 1, enabled + usize::from(option.enabled))
                });

            (present > 0 && enabled == 0).then(|| ValidationFailure::NoneEnabledInCategory {
                category: category.name.clone(),
            })
        })
    }

    fn validate_min_lengths<'a>(
        &'a self,
        options: &'a [UserDefine],
    ) -> impl Iterator<Item = ValidationFailure> + 'a {
        self.min_lengths.iter().filter_map(move |rule| {
            let option = first_with_key(options, &rule.key).filter(|option| option.enabled)?;
            let length = option.value.as_deref()?.chars().count();

            (length < rule.min_length).then(|| ValidationFailure::TooShort {
                key: rule.key.clone(),
                description: rule.description.clone(),
                min_length: rule.min_length,
                length,
            })
        })
    }

    fn validate_non_empty<'a>(
        &'a self,
        options: &'a [UserDefine],
    ) -> impl Iterator<Item = ValidationFailure> + 'a {
        self.non_empty.iter().filter_map(move |rule| {
            let option = first_with_key(options, &rule.key).filter(|option| option.enabled)?;

            option
                .value
                .as_deref()
                .map_or(true, str::is_empty)
                .then(|| ValidationFailure::Empty {
                    key: rule.key.clone(),
                    description: rule.description.clone(),
                })
        })
    }

    /// Check options against these rules.
    ///
    /// Category failures come first, then length failures, then emptiness failures.
    /// An empty list means the options are fine.
    pub fn validate(&self, options: &[UserDefine]) -> Vec<ValidationFailure> {
        self.validate_categories(options)
            .chain(self.validate_min_lengths(options))
            .chain(self.validate_non_empty(options))
            .collect()
    }
}

/// Some options, for showing what an options file looks like.
pub fn example_options() -> Vec<UserDefine> {
    vec![
        UserDefine::new(UserDefineKey::RegulatoryDomainEu868, true),
        UserDefine::new(UserDefineKey::RegulatoryDomainFcc915, false),
        UserDefine::with_value(UserDefineKey::BindingPhrase, true, "my binding phrase"),
        UserDefine::with_value(UserDefineKey::MyStartupMelody, false, ""),
    ]
}

/// Check options against the default [`RuleSet`].
pub fn validate(options: &[UserDefine]) -> Vec<ValidationFailure> {
    RuleSet::default().validate(options)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use UserDefineKey::*;

    fn none_in(category: &str) -> ValidationFailure {
        ValidationFailure::NoneEnabledInCategory {
            category: category.into(),
        }
    }

    #[test]
    fn nothing_to_validate() {
        assert!(validate(&[]).is_empty());
    }

    #[test]
    fn category_none_enabled() {
        let options = [
            UserDefine::new(RegulatoryDomainEu433, false),
            UserDefine::new(RegulatoryDomainAu433, false),
        ];

        let failures = validate(&options);

        assert_eq!(failures, vec![none_in("400 Mhz")]);
        assert!(failures[0].to_string().contains("400 Mhz"));
    }

    #[test]
    fn category_one_enabled() {
        let options = [
            UserDefine::new(RegulatoryDomainEu433, false),
            UserDefine::new(RegulatoryDomainAu433, true),
        ];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn absent_categories_do_not_apply() {
        // Only 900 MHz options present, the others are vacuous.
        let options = [
            UserDefine::new(RegulatoryDomainFcc915, true),
            UserDefine::new(RegulatoryDomainEu868, false),
        ];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn several_categories_fail_in_rule_order() {
        let options = [
            UserDefine::new(RegulatoryDomainIsm2400, false),
            UserDefine::new(RegulatoryDomainEu433, false),
            UserDefine::new(RegulatoryDomainAu915, false),
        ];

        assert_eq!(
            validate(&options),
            vec![none_in("400 Mhz"), none_in("900 MHz"), none_in("2.4 GHz")]
        );
    }

    #[test]
    fn binding_phrase_too_short() {
        let options = [UserDefine::with_value(BindingPhrase, true, "abc")];

        assert_eq!(
            validate(&options),
            vec![ValidationFailure::TooShort {
                key: BindingPhrase,
                description: "Custom binding phrase".into(),
                min_length: 6,
                length: 3,
            }]
        );
    }

    #[test]
    fn binding_phrase_long_enough() {
        let options = [UserDefine::with_value(BindingPhrase, true, "abcdef")];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn binding_phrase_disabled_is_exempt() {
        let options = [UserDefine::with_value(BindingPhrase, false, "abc")];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn binding_phrase_without_value_is_not_checked() {
        let options = [UserDefine::new(BindingPhrase, true)];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn length_counts_characters() {
        // Six characters, more bytes.
        let options = [UserDefine::with_value(BindingPhrase, true, "æøåæøå")];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn startup_melody_empty() {
        let options = [UserDefine::with_value(MyStartupMelody, true, "")];

        let failures = validate(&options);

        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].to_string(),
            "Custom startup melody selected, but not entered"
        );
    }

    #[test]
    fn startup_melody_missing_value() {
        let options = [UserDefine::new(MyStartupMelody, true)];

        assert_eq!(validate(&options).len(), 1);
    }

    #[test]
    fn startup_melody_disabled() {
        let options = [UserDefine::with_value(MyStartupMelody, false, "")];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn failures_are_ordered_by_rule_family() {
        let options = [
            UserDefine::with_value(MyStartupMelody, true, ""),
            UserDefine::with_value(BindingPhrase, true, "abc"),
            UserDefine::new(RegulatoryDomainEu433, false),
        ];

        let failures = validate(&options);

        assert!(matches!(
            failures.as_slice(),
            [
                ValidationFailure::NoneEnabledInCategory { .. },
                ValidationFailure::TooShort { .. },
                ValidationFailure::Empty { .. },
            ]
        ));
    }

    #[test]
    fn only_the_first_option_with_a_key_is_checked() {
        let options = [
            UserDefine::with_value(BindingPhrase, true, "long enough"),
            UserDefine::with_value(BindingPhrase, true, "abc"),
        ];

        assert!(validate(&options).is_empty());
    }

    #[test]
    fn unknown_keys_pass_through() {
        let options = [
            UserDefine::with_value("SOMETHING_NEW", true, ""),
            UserDefine::new("ANOTHER_ONE", false),
        ];

        assert!(!options[0].key.is_recognized());
        assert!(validate(&options).is_empty());
    }

    #[test]
    fn keys_keep_their_names() {
        assert_eq!(UserDefineKey::from("BINDING_PHRASE"), BindingPhrase);
        assert_eq!(String::from(RegulatoryDomainEuCe2400), "REGULATORY_DOMAIN_EU_CE_2400");
        assert_eq!(
            String::from(UserDefineKey::from("NOT_A_KEY")),
            "NOT_A_KEY"
        );
    }

    #[test]
    fn options_from_json() {
        let input = r#"[
            {"key": "REGULATORY_DOMAIN_EU_868", "enabled": true},
            {"key": "BINDING_PHRASE", "enabled": true, "value": "my phrase"},
            {"key": "SOMETHING_NEW", "enabled": false, "value": null}
        ]"#;

        let options: Vec<UserDefine> = serde_json::from_str(input).unwrap();

        assert_eq!(options[0].key, RegulatoryDomainEu868);
        assert_eq!(options[1].value.as_deref(), Some("my phrase"));
        assert_eq!(options[2].key, UserDefineKey::Other("SOMETHING_NEW".into()));
        assert!(validate(&options).is_empty());
    }

    #[test]
    fn custom_rules() {
        let rules = RuleSet {
            categories: vec![],
            min_lengths: vec![MinLength {
                key: HomeWifiPassword,
                min_length: 8,
                description: "Wifi password".into(),
            }],
            non_empty: vec![NonEmpty {
                key: HomeWifiSsid,
                description: "Wifi network".into(),
            }],
        };
        rules.check().unwrap();

        let options = [
            UserDefine::with_value(HomeWifiSsid, true, ""),
            UserDefine::with_value(HomeWifiPassword, true, "hunter2"),
            // Default rules do not apply.
            UserDefine::with_value(BindingPhrase, true, "abc"),
        ];

        let failures = rules.validate(&options);

        assert_eq!(failures.len(), 2);
        assert!(failures[0].to_string().starts_with("Wifi password"));
        assert!(failures[1].to_string().starts_with("Wifi network"));
    }

    #[test]
    fn example_options_are_valid() {
        assert!(validate(&example_options()).is_empty());
    }

    #[test]
    fn default_rules_are_sane() {
        RuleSet::default().check().unwrap();
    }

    #[test]
    fn rules_round_trip_ron() {
        let rules = RuleSet::default();

        let serialized = rules.serialize_pretty().unwrap();
        println!("{serialized}");

        assert!(serialized.contains("REGULATORY_DOMAIN_EU_433"));
        assert_eq!(RuleSet::deserialize(&serialized).unwrap(), rules);
    }

    #[test]
    fn rules_from_ron() {
        let input = r#"
(
    categories: [
        (
            name: "900 MHz",
            keys: ["REGULATORY_DOMAIN_FCC_915", "REGULATORY_DOMAIN_EU_868"],
        ),
    ],
    min_lengths: [],
    non_empty: [],
)
"#;
        let rules = RuleSet::deserialize(input).unwrap();

        assert_eq!(rules.categories[0].keys[0], RegulatoryDomainFcc915);
    }

    #[test]
    fn bad_rules_empty_category() {
        let mut rules = RuleSet::default();
        rules.categories[1].keys.clear();

        let err = rules.check().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("900 MHz"));
    }

    #[test]
    fn bad_rules_duplicate_category_names() {
        let mut rules = RuleSet::default();
        rules.categories.push(Category {
            name: "400 Mhz".into(),
            keys: vec![UserDefineKey::from("SOME_KEY")],
        });

        let err = rules.check().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("400 Mhz"));
    }

    #[test]
    fn bad_rules_key_in_several_categories() {
        let mut rules = RuleSet::default();
        rules.categories.push(Category {
            name: "Everywhere".into(),
            keys: vec![RegulatoryDomainEu868],
        });

        let err = rules.check().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("REGULATORY_DOMAIN_EU_868"));
        assert!(!err.contains("REGULATORY_DOMAIN_AU_915"));
    }

    #[test]
    fn bad_rules_zero_min_length() {
        let mut rules = RuleSet::default();
        rules.min_lengths[0].min_length = 0;

        let err = rules.check().unwrap_err().try_into_bad_config().unwrap();

        assert!(err.contains("BINDING_PHRASE"));
    }

    #[test]
    fn bad_rules_ron() {
        assert!(matches!(
            RuleSet::deserialize("(categories: oops)"),
            Err(Error::BadConfig(_))
        ));
    }
}
