//! Named runtime settings
//!
//! Settings are declared as statics next to the code they influence and read
//! their current value from a process-wide registry of string overrides.
//! The registry is the only global mutable state in the crate; it is
//! initialized lazily on first use and lives until process exit.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::str::FromStr;
use std::sync::RwLock;

static REGISTRY: Lazy<RwLock<FxHashMap<&'static str, String>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

/// Override a setting by name. The value is parsed on the next `get()`.
pub fn set(name: &'static str, value: impl Into<String>) {
    REGISTRY
        .write()
        .expect("settings registry poisoned")
        .insert(name, value.into());
}

/// Remove an override, restoring the compiled-in default.
pub fn reset(name: &str) {
    REGISTRY
        .write()
        .expect("settings registry poisoned")
        .remove(name);
}

fn lookup(name: &str) -> Option<String> {
    REGISTRY
        .read()
        .expect("settings registry poisoned")
        .get(name)
        .cloned()
}

/// A named setting with a default value
pub struct Setting<T> {
    name: &'static str,
    #[allow(dead_code)]
    description: &'static str,
    default: T,
}

impl<T> Setting<T> {
    pub const fn new(name: &'static str, description: &'static str, default: T) -> Self {
        Setting {
            name,
            description,
            default,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: FromStr + Clone> Setting<T> {
    /// Current value: the parsed override if one is set, the default
    /// otherwise. Unparsable overrides fall back to the default.
    pub fn get(&self) -> T {
        match lookup(self.name) {
            Some(raw) => raw.parse().unwrap_or_else(|_| self.default.clone()),
            None => self.default.clone(),
        }
    }
}

impl Setting<bool> {
    /// Boolean settings also accept "0"/"1".
    pub fn get_bool(&self) -> bool {
        match lookup(self.name).as_deref() {
            Some("1") => true,
            Some("0") => false,
            Some(raw) => raw.parse().unwrap_or(self.default),
            None => self.default,
        }
    }
}

/// A string-valued setting (the default lives in static storage)
pub struct StringSetting {
    name: &'static str,
    #[allow(dead_code)]
    description: &'static str,
    default: &'static str,
}

impl StringSetting {
    pub const fn new(name: &'static str, description: &'static str, default: &'static str) -> Self {
        StringSetting {
            name,
            description,
            default,
        }
    }

    pub fn get(&self) -> String {
        lookup(self.name).unwrap_or_else(|| self.default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEFAULT_FLAG: Setting<bool> = Setting::new("testDefaultFlag", "a test flag", false);
    static DEFAULT_LEVEL: Setting<u32> = Setting::new("testDefaultLevel", "a test level", 3);
    static OVERRIDE_FLAG: Setting<bool> = Setting::new("testOverrideFlag", "a test flag", false);
    static OVERRIDE_LEVEL: Setting<u32> = Setting::new("testOverrideLevel", "a test level", 3);

    #[test]
    fn defaults_apply_without_override() {
        assert!(!DEFAULT_FLAG.get_bool());
        assert_eq!(DEFAULT_LEVEL.get(), 3);
    }

    #[test]
    fn overrides_are_parsed() {
        set("testOverrideFlag", "1");
        assert!(OVERRIDE_FLAG.get_bool());
        set("testOverrideFlag", "false");
        assert!(!OVERRIDE_FLAG.get_bool());
        set("testOverrideLevel", "0");
        assert_eq!(OVERRIDE_LEVEL.get(), 0);
        reset("testOverrideFlag");
        reset("testOverrideLevel");
    }
}
