//! In-crate modules and the helpers they share.

pub mod null_sink;
pub mod sine;

use std::collections::HashMap;

use crate::error::Error;

/// Parsed module arguments: whitespace-separated `key=value` pairs.
#[derive(Debug, Default)]
pub struct ModArgs(HashMap<String, String>);

impl ModArgs {
    /// Parses an argument string, rejecting malformed or duplicate keys.
    pub fn parse(argument: Option<&str>) -> Result<ModArgs, Error> {
        let mut map = HashMap::new();

        for token in argument.unwrap_or("").split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| Error::Invalid(format!("malformed module argument \"{token}\"")))?;

            if map.insert(key.to_owned(), value.to_owned()).is_some() {
                return Err(Error::Invalid(format!("duplicate module argument \"{key}\"")));
            }
        }

        Ok(ModArgs(map))
    }

    /// The value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The value for `key` parsed as a number.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| Error::Invalid(format!("argument \"{key}\" is not a number: {v}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_key_value_pairs() {
        let args = ModArgs::parse(Some("sink_name=out rate=48000")).unwrap();
        assert_eq!(args.get("sink_name"), Some("out"));
        assert_eq!(args.get_u32("rate").unwrap(), Some(48000));
        assert_eq!(args.get("missing"), None);
    }

    #[test]
    fn rejects_malformed_and_duplicate_keys() {
        assert_matches!(ModArgs::parse(Some("oops")), Err(Error::Invalid(_)));
        assert_matches!(ModArgs::parse(Some("a=1 a=2")), Err(Error::Invalid(_)));
    }
}
