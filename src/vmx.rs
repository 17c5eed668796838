//! VMware `.vmx` configuration files.
//!
//! A vmx file is a list of `key = "value"` lines, comments and blank lines.
//! Lines that are not changed are written back as they were read.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const NVRAM_KEY: &str = "nvram";
pub const UUID_BIOS_KEY: &str = "uuid.bios";
pub const UUID_LOCATION_KEY: &str = "uuid.location";

const BLANKS: [char; 2] = [' ', '\t'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Empty,
    Comment(String),
    KeyValue { key: String, value: String },
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Line::Empty => Ok(()),
            Line::Comment(comment) => write!(f, "# {}", comment),
            Line::KeyValue { key, value } => {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "{} = \"{}\"", key, escaped)
            }
        }
    }
}

#[derive(Debug)]
struct VmxLine {
    line: Line,
    // Text as read from the file, dropped once the line changes.
    original: Option<String>,
}

#[derive(Debug)]
pub struct Vmx {
    path: PathBuf,
    lines: Vec<VmxLine>,
}

fn parse_line(text: &str, number: usize) -> Result<Line> {
    let err = |reason: String| Error::Vmx {
        line: number,
        reason,
    };

    if text.is_empty() {
        return Ok(Line::Empty);
    }

    if let Some(comment) = text.strip_prefix('#') {
        return Ok(Line::Comment(comment.trim_matches(&BLANKS[..]).to_string()));
    }

    let mut chars = text.chars().peekable();

    let mut key = String::new();
    while let Some(c) = chars.next_if(|&c| !BLANKS.contains(&c) && c != '=') {
        key.push(c);
    }

    if chars.peek().is_none() {
        return Err(err("unexpected end-of-line when parsing key".to_string()));
    }

    while chars.next_if(|c| BLANKS.contains(c)).is_some() {}

    match chars.next() {
        Some('=') => {}
        Some(c) => {
            return Err(err(format!(
                "unexpected character '{}' when searching key-value separator", c)));
        }
        None => {
            return Err(err(
                "unexpected end-of-line when searching key-value separator".to_string()));
        }
    }

    while chars.next_if(|c| BLANKS.contains(c)).is_some() {}

    match chars.next() {
        Some('"') => {}
        Some(c) => {
            return Err(err(format!("unexpected character '{}' when searching value", c)));
        }
        None => {
            return Err(err("unexpected end-of-line when searching value".to_string()));
        }
    }

    let mut value = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some(c) => value.push(c),
                None => break,
            },
            Some('"') => return Ok(Line::KeyValue { key, value }),
            Some(c) => value.push(c),
            None => break,
        }
    }

    Err(err("unexpected end-of-line when parsing value".to_string()))
}

impl Vmx {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("can't read the file '{}'", path.display()), e))?;

        Self::parse(path, &text)
    }

    /// Parse vmx text. `path` is only recorded.
    pub fn parse<P: Into<PathBuf>>(path: P, text: &str) -> Result<Self> {
        let mut lines = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let trimmed = raw.trim_matches(&[' ', '\t', '\r'][..]);
            lines.push(VmxLine {
                line: parse_line(trimmed, i + 1)?,
                original: Some(trimmed.to_string()),
            });
        }

        debug!("vmx: {} lines", lines.len());

        Ok(Vmx {
            path: path.into(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter().map(|l| &l.line)
    }

    fn value_mut(&mut self, key: &str) -> Option<&mut VmxLine> {
        self.lines
            .iter_mut()
            .find(|l| matches!(&l.line, Line::KeyValue { key: k, .. } if k == key))
    }

    pub fn is_modified(&self) -> bool {
        self.lines.iter().any(|l| l.original.is_none())
    }

    /// The value of the first line with this key.
    pub fn get_string_value(&self, key: &str) -> Option<&str> {
        self.lines().find_map(|l| match l {
            Line::KeyValue { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Update the value of `key`, appending a new line if the key is not
    /// present.
    pub fn set_value(&mut self, key: &str, value: &str) {
        match self.value_mut(key) {
            Some(VmxLine {
                line: Line::KeyValue { value: v, .. },
                original,
            }) => {
                *v = value.to_string();
                *original = None;
            }
            _ => self.lines.push(VmxLine {
                line: Line::KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                original: None,
            }),
        }
    }

    /// Rewrite the BIOS and location UUIDs of the machine. Keys that are not
    /// in the file are not added; returns whether anything changed.
    pub fn set_machine_uuid(&mut self, uuid: &Uuid) -> bool {
        let b = uuid.as_bytes();
        let half = |bytes: &[u8]| {
            bytes.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
        };
        let value = format!("{}-{}", half(&b[..8]), half(&b[8..]));

        let mut changed = false;
        for key in [UUID_BIOS_KEY, UUID_LOCATION_KEY] {
            if self.get_string_value(key).is_some() {
                self.set_value(key, &value);
                changed = true;
            }
        }
        changed
    }

    /// Write to a new file, removing it again if writing fails.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(format!("can't create the file '{}'", path.display()), e))?;

        let mut writer = BufWriter::new(file);
        let result = write!(writer, "{}", self).and_then(|_| writer.flush());

        if let Err(e) = result {
            drop(writer);
            if let Err(rm) = fs::remove_file(path) {
                warn!("can't remove {}: {}", path.display(), rm);
            }
            return Err(Error::io(format!("can't write the file '{}'", path.display()), e));
        }

        Ok(())
    }
}

impl fmt::Display for Vmx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for l in &self.lines {
            match &l.original {
                Some(text) => writeln!(f, "{}", text)?,
                None => writeln!(f, "{}", l.line)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
.encoding = \"UTF-8\"
config.version = \"8\"

#   Generated by the hypervisor
displayName=\"macOS \\\"13\\\"\"
  nvram  =   \"macOS 13.nvram\"
uuid.bios = \"56 4d 00 00 00 00 00 00-00 00 00 00 00 00 00 00\"
";

    fn sample() -> Vmx {
        Vmx::parse("test.vmx", SAMPLE).unwrap()
    }

    #[test]
    fn parse() {
        let vmx = sample();
        let lines: Vec<_> = vmx.lines().cloned().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[2], Line::Empty);
        assert_eq!(lines[3], Line::Comment("Generated by the hypervisor".to_string()));
        assert_eq!(
            lines[4],
            Line::KeyValue {
                key: "displayName".to_string(),
                value: "macOS \"13\"".to_string()
            }
        );
        assert_eq!(vmx.get_string_value(NVRAM_KEY), Some("macOS 13.nvram"));
        assert_eq!(vmx.get_string_value("config.version"), Some("8"));
        assert_eq!(vmx.get_string_value("missing"), None);
    }

    #[test]
    fn parse_errors() {
        for (text, line, reason) in [
            ("a = \"1\"\nkey", 2, "unexpected end-of-line when parsing key"),
            ("key   ", 1, "unexpected end-of-line when parsing key"),
            ("key x", 1, "unexpected character 'x' when searching key-value separator"),
            ("key =", 1, "unexpected end-of-line when searching value"),
            ("key = value", 1, "unexpected character 'v' when searching value"),
            ("\n\nkey = \"value", 3, "unexpected end-of-line when parsing value"),
            ("key = \"value\\", 1, "unexpected end-of-line when parsing value"),
        ] {
            match Vmx::parse("x.vmx", text) {
                Err(Error::Vmx { line: l, reason: r }) => {
                    assert_eq!((l, r.as_str()), (line, reason), "{:?}", text);
                }
                r => panic!("{:?} gave {:?}", text, r),
            }
        }
    }

    #[test]
    fn untouched_lines_are_kept() {
        let vmx = sample();
        assert!(!vmx.is_modified());
        let out = vmx.to_string();
        assert!(out.contains("displayName=\"macOS \\\"13\\\"\"\n"));
        assert!(out.contains("\n#   Generated by the hypervisor\n"));
        assert!(out.contains("\nnvram  =   \"macOS 13.nvram\"\n"));
        assert_eq!(out.lines().count(), 7);
    }

    #[test]
    fn set_value() {
        let mut vmx = sample();
        vmx.set_value("displayName", "a \"b\" \\c");
        vmx.set_value("new.key", "1");
        assert!(vmx.is_modified());

        let out = vmx.to_string();
        assert!(out.contains("\ndisplayName = \"a \\\"b\\\" \\\\c\"\n"));
        assert!(out.ends_with("new.key = \"1\"\n"));

        let vmx = Vmx::parse("x.vmx", &out).unwrap();
        assert_eq!(vmx.get_string_value("displayName"), Some("a \"b\" \\c"));
        assert_eq!(vmx.get_string_value("new.key"), Some("1"));
    }

    #[test]
    fn machine_uuid() {
        let uuid = Uuid::parse_str("564d5a6c-1f0e-4a3b-9c2d-7e8f90a1b2c3").unwrap();
        let mut vmx = sample();
        assert!(vmx.set_machine_uuid(&uuid));
        assert_eq!(
            vmx.get_string_value(UUID_BIOS_KEY),
            Some("56 4d 5a 6c 1f 0e 4a 3b-9c 2d 7e 8f 90 a1 b2 c3")
        );
        // Not added when missing.
        assert_eq!(vmx.get_string_value(UUID_LOCATION_KEY), None);

        let mut vmx = Vmx::parse("x.vmx", "a = \"b\"\n").unwrap();
        assert!(!vmx.set_machine_uuid(&uuid));
        assert_eq!(vmx.to_string(), "a = \"b\"\n");
    }

    #[test]
    fn files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.vmx");
        fs::write(&path, SAMPLE).unwrap();

        let mut vmx = Vmx::open(&path).unwrap();
        assert_eq!(vmx.path(), path.as_path());
        vmx.set_value("config.version", "9");

        let out = dir.path().join("out.vmx");
        vmx.write_to_file(&out).unwrap();
        let reread = Vmx::open(&out).unwrap();
        assert_eq!(reread.get_string_value("config.version"), Some("9"));

        assert!(matches!(vmx.write_to_file(&out), Err(Error::Io { .. })));
        assert!(matches!(
            Vmx::open(dir.path().join("missing.vmx")),
            Err(Error::Io { .. })
        ));
    }
}
