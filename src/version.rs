use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A `major.minor.patch` release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn component(s: Option<&str>, what: &'static str) -> Result<u32> {
    match s {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse().map_err(|_| Error::InvalidVersion(what))
        }
        _ => Err(Error::InvalidVersion(what)),
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');

        let major = component(parts.next(), "major")?;
        let minor = component(parts.next(), "minor")?;
        let patch = component(parts.next(), "patch")?;

        Ok(Version::new(major, minor, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("10.15.7".parse::<Version>().unwrap(), Version::new(10, 15, 7));
        assert_eq!("13.0.0".parse::<Version>().unwrap().to_string(), "13.0.0");
    }

    #[test]
    fn parse_errors() {
        for (s, field) in [
            ("", "major"),
            ("10", "minor"),
            ("x.1.2", "major"),
            ("10..2", "minor"),
            ("10.15", "patch"),
            ("10.15.", "patch"),
            ("10.15.7.1", "patch"),
            ("10.15.7 ", "patch"),
            ("+10.15.7", "major"),
        ] {
            match s.parse::<Version>() {
                Err(Error::InvalidVersion(f)) => assert_eq!(f, field, "{:?}", s),
                r => panic!("{:?} parsed as {:?}", s, r),
            }
        }
    }

    #[test]
    fn ordering() {
        let v = |s: &str| s.parse::<Version>().unwrap();
        assert!(v("10.16.0") > v("10.15.99"));
        assert!(v("11.0.0") > v("10.99.99"));
        assert!(v("10.13.6") < v("10.14.0"));
        assert_eq!(v("12.1.0").max(v("12.0.9")), v("12.1.0"));
    }
}
