use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde::Serializer;

use binrw::io::Cursor;
use binrw::{binrw, BinReaderExt, BinWriterExt};

use crate::error::{Error, Result};

pub const EFI_VARIABLE_NON_VOLATILE: u32                           = 0x00000001;
pub const EFI_VARIABLE_BOOTSERVICE_ACCESS: u32                     = 0x00000002;
pub const EFI_VARIABLE_RUNTIME_ACCESS: u32                         = 0x00000004;
pub const EFI_VARIABLE_HARDWARE_ERROR_RECORD: u32                  = 0x00000008;
pub const EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS: u32             = 0x00000010;
pub const EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32  = 0x00000020;
pub const EFI_VARIABLE_APPEND_WRITE: u32                           = 0x00000040;

/// Attributes given to variables created by this tool.
pub const DEFAULT_ATTRIBUTES: u32 = EFI_VARIABLE_NON_VOLATILE
    | EFI_VARIABLE_BOOTSERVICE_ACCESS
    | EFI_VARIABLE_RUNTIME_ACCESS;

pub const EFI_GLOBAL_VARIABLE_GUID: EfiGuid = EfiGuid::new(
    0x8be4_df61, 0x93ca, 0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

pub const APPLE_VENDOR_GUID: EfiGuid = EfiGuid::new(
    0xac39_c713, 0x7e50, 0x423d,
    [0x88, 0x9d, 0x27, 0x8f, 0xcc, 0x34, 0x22, 0xb6],
);

pub const APPLE_FIRMWARE_VARIABLE_GUID: EfiGuid = EfiGuid::new(
    0x4d1e_de05, 0x38c7, 0x4a6a,
    [0x9c, 0xc6, 0x4b, 0xcc, 0xa8, 0xb3, 0x8c, 0x14],
);

pub const APPLE_NVRAM_VARIABLE_GUID: EfiGuid = EfiGuid::new(
    0x7c43_6110, 0xab2a, 0x4bbb,
    [0xa8, 0x80, 0xfe, 0x41, 0x99, 0x5c, 0x9f, 0x82],
);

pub const APPLE_SCREEN_RESOLUTION_GUID: EfiGuid = EfiGuid::new(
    0xac20_c489, 0xdd86, 0x4e99,
    [0x99, 0x2c, 0xb7, 0xc7, 0x42, 0xc1, 0xdd, 0xa9],
);

pub const DHCPV6_SERVICE_BINDING_GUID: EfiGuid = EfiGuid::new(
    0x9fb9_a8a1, 0x2f4a, 0x43a6,
    [0x88, 0x9c, 0xd0, 0xf7, 0xb6, 0xc4, 0x7a, 0xd5],
);

/// Length of the textual form of a GUID.
pub const GUID_STRING_SIZE: usize = 36;

#[binrw]
#[brw(little)]
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Default)]
pub struct EfiGuid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl EfiGuid {
    pub const SIZE: usize = 16;

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }

    /// Decode the on-disk layout (three little-endian integers followed by
    /// eight bytes).
    pub fn from_bytes(b: &[u8; 16]) -> Result<Self> {
        Ok(Cursor::new(&b[..]).read_le()?)
    }

    pub fn to_bytes(&self) -> Result<[u8; 16]> {
        let mut out = [0u8; 16];
        Cursor::new(&mut out[..]).write_le(self)?;
        Ok(out)
    }

    /// Symbolic name of a well-known GUID.
    pub fn known_name(&self) -> Option<&'static str> {
        KNOWN_GUIDS.get(self).copied()
    }
}

impl fmt::Display for EfiGuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-\
            {:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1],
            self.data4[2], self.data4[3], self.data4[4], self.data4[5],
            self.data4[6], self.data4[7])
    }
}

impl FromStr for EfiGuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidGuid {
            guid: s.to_string(),
            reason,
        };

        if s.len() != GUID_STRING_SIZE {
            return Err(invalid("invalid string size"));
        }

        if !s.is_ascii() {
            return Err(invalid("invalid number of components"));
        }

        // 8-4-4-2+2-6x2 hex digit groups.
        let bytes = s.as_bytes();
        let mut fields = Vec::with_capacity(11);
        let mut pos = 0;
        for (i, width) in [8, 4, 4, 2, 2, 2, 2, 2, 2, 2, 2].into_iter().enumerate() {
            if i == 1 || i == 2 || i == 3 || i == 5 {
                if bytes[pos] != b'-' {
                    return Err(invalid("invalid number of components"));
                }
                pos += 1;
            }
            let digits = &s[pos..pos + width];
            if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid("invalid number of components"));
            }
            let value = u32::from_str_radix(digits, 16)
                .map_err(|_| invalid("invalid number of components"))?;
            fields.push(value);
            pos += width;
        }

        let mut data4 = [0u8; 8];
        for (byte, value) in data4.iter_mut().zip(&fields[3..]) {
            *byte = *value as u8;
        }

        Ok(EfiGuid::new(fields[0], fields[1] as u16, fields[2] as u16, data4))
    }
}

impl Serialize for EfiGuid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Compact flag list, e.g. `NV+BS+RT`.
pub fn attributes_summary(attributes: u32) -> String {
    let mut attrlist = Vec::new();

    if attributes & EFI_VARIABLE_NON_VOLATILE != 0 {
        attrlist.push("NV");
    }

    if attributes & EFI_VARIABLE_BOOTSERVICE_ACCESS != 0 {
        attrlist.push("BS");
    }

    if attributes & EFI_VARIABLE_RUNTIME_ACCESS != 0 {
        attrlist.push("RT");
    }

    if attributes & EFI_VARIABLE_HARDWARE_ERROR_RECORD != 0 {
        attrlist.push("HR");
    }

    if attributes & EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS != 0 {
        attrlist.push("AW");
    }

    if attributes & EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS != 0 {
        attrlist.push("AT");
    }

    if attributes & EFI_VARIABLE_APPEND_WRITE != 0 {
        attrlist.push("AP");
    }

    attrlist.join("+")
}

/// Descriptive names of every attribute bit set in `attributes`.
pub fn attribute_names(attributes: u32) -> Vec<&'static str> {
    const NAMES: [(u32, &str); 7] = [
        (EFI_VARIABLE_NON_VOLATILE, "efi-variable-non-volatile"),
        (EFI_VARIABLE_BOOTSERVICE_ACCESS, "efi-variable-bootservice-access"),
        (EFI_VARIABLE_RUNTIME_ACCESS, "efi-variable-runtime-access"),
        (EFI_VARIABLE_HARDWARE_ERROR_RECORD, "efi-variable-hardware-error-record"),
        (EFI_VARIABLE_AUTHENTICATED_WRITE_ACCESS,
            "efi-variable-authenticated-write-access"),
        (EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS,
            "efi-variable-time-based-authenticated-write-access"),
        (EFI_VARIABLE_APPEND_WRITE, "efi-variable-append-write"),
    ];

    NAMES
        .iter()
        .filter(|(bit, _)| attributes & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// UTF-16LE variable names. Buffers are length-bounded: nothing here
/// relies on a terminating NUL being present.
pub mod utf16 {
    use std::char::decode_utf16;

    use crate::error::{Error, Result};

    /// Decode a UTF-16LE buffer, stopping at the first NUL code unit.
    pub fn decode(bytes: &[u8]) -> Result<String> {
        if bytes.len() % 2 != 0 {
            return Err(Error::Encoding("UTF-16 to UTF-8"));
        }

        let units = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0);

        decode_utf16(units)
            .collect::<std::result::Result<String, _>>()
            .map_err(|_| Error::Encoding("UTF-16 to UTF-8"))
    }

    /// Encode `s` as UTF-16LE, optionally followed by a NUL code unit.
    pub fn encode(s: &str, terminal_zero: bool) -> Result<Vec<u8>> {
        if s.contains('\0') {
            return Err(Error::Encoding("UTF-8 to UTF-16"));
        }

        let mut v: Vec<u16> = s.encode_utf16().collect();
        if terminal_zero {
            v.push(0);
        }

        Ok(v.iter().flat_map(|u| u.to_le_bytes()).collect())
    }
}

lazy_static! {
    static ref KNOWN_GUIDS: HashMap<EfiGuid, &'static str> = {
        [
            (EFI_GLOBAL_VARIABLE_GUID, "GLOBAL_VARIABLE"),
            (APPLE_VENDOR_GUID, "APPLE_VENDOR"),
            (APPLE_FIRMWARE_VARIABLE_GUID, "APPLE_FIRMWARE_VARIABLE"),
            (APPLE_NVRAM_VARIABLE_GUID, "APPLE_NVRAM_VARIABLE"),
            (APPLE_SCREEN_RESOLUTION_GUID, "APPLE_SCREEN_RESOLUTION"),
            (DHCPV6_SERVICE_BINDING_GUID,
                "EFI_DHCP6_SERVICE_BINDING_PROTOCOL_GUID"),
            (EfiGuid::new(0x04b3_7fe8, 0xf6ae, 0x480b,
                [0xbd, 0xd5, 0x37, 0xd9, 0x8c, 0x5e, 0x89, 0xaa]),
                "EDKII_VAR_ERROR_FLAG"),
            (EfiGuid::new(0x4c19_049f, 0x4137, 0x4dd3,
                [0x9c, 0x10, 0x8b, 0x97, 0xa8, 0x3f, 0xfd, 0xfa]),
                "EFI_MEMORY_TYPE_INFORMATION_GUID"),
            (EfiGuid::new(0x5b44_6ed1, 0xe30b, 0x4faa,
                [0x87, 0x1a, 0x36, 0x54, 0xec, 0xa3, 0x60, 0x80]),
                "EFI_IP4_CONFIG2_PROTOCOL_GUID"),
            (EfiGuid::new(0x9373_08fe, 0x5fed, 0x4ac0,
                [0xb6, 0xa2, 0x4a, 0xaf, 0x11, 0x3c, 0xd3, 0xe6]),
                "EFI_IP6_CONFIG_PROTOCOL_GUID"),
            (EfiGuid::new(0xd719_b2cb, 0x3d3a, 0x4596,
                [0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f]),
                "EFI_IMAGE_SECURITY_DATABASE_GUID"),
            (EfiGuid::new(0xeb70_4011, 0x1402, 0x11d3,
                [0x8e, 0x77, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b]),
                "MTC_VENDOR"),
            (EfiGuid::new(0x77fa_9abd, 0x0359, 0x4d32,
                [0xbd, 0x60, 0x28, 0xf4, 0xe7, 0x8f, 0x78, 0x4b]),
                "SecureBootPlatformID"),
        ].into_iter().collect()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn guid_to_str() {
        assert_eq!(
            EFI_GLOBAL_VARIABLE_GUID.to_string(),
            "8BE4DF61-93CA-11D2-AA0D-00E098032B8C"
        );
        assert_eq!(
            EfiGuid::default().to_string(),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn guid_from_str() {
        assert_eq!(
            EfiGuid::from_str("8be4df61-93ca-11d2-aa0d-00e098032b8c").unwrap(),
            EFI_GLOBAL_VARIABLE_GUID
        );
        assert_eq!(
            "7C436110-AB2A-4BBB-A880-FE41995C9F82".parse::<EfiGuid>().unwrap(),
            APPLE_NVRAM_VARIABLE_GUID
        );
    }

    #[test]
    fn guid_from_str_err() {
        for bad in [
            "",
            "8be4df61-93ca-11d2-aa0d-00e098032b8",
            "018be4df61-93ca-11d2-aa0d-00e098032b8c",
            "xbe4df61-93ca-11d2-aa0d-00e098032b8c",
            "8be4df61+93ca-11d2-aa0d-00e098032b8c",
            "8be4df6193ca-11d2-aa0d-00e098032b8c0",
            "8be4df61-93ca-11d2-aa0d-00e098032b8\u{e9}",
        ] {
            assert!(
                matches!(EfiGuid::from_str(bad), Err(Error::InvalidGuid { .. })),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn guid_bytes_layout() {
        let raw = APPLE_NVRAM_VARIABLE_GUID.to_bytes().unwrap();
        assert_eq!(&raw[..4], &[0x10, 0x61, 0x43, 0x7c]);
        assert_eq!(&raw[4..8], &[0x2a, 0xab, 0xbb, 0x4b]);
        assert_eq!(&raw[8..], &[0xa8, 0x80, 0xfe, 0x41, 0x99, 0x5c, 0x9f, 0x82]);
        assert_eq!(EfiGuid::from_bytes(&raw).unwrap(), APPLE_NVRAM_VARIABLE_GUID);
    }

    #[test]
    fn known_names() {
        assert_eq!(
            APPLE_NVRAM_VARIABLE_GUID.known_name(),
            Some("APPLE_NVRAM_VARIABLE")
        );
        assert_eq!(EfiGuid::default().known_name(), None);
    }

    #[test]
    fn attributes() {
        assert_eq!(attributes_summary(DEFAULT_ATTRIBUTES), "NV+BS+RT");
        assert_eq!(attributes_summary(0), "");
        assert_eq!(
            attribute_names(EFI_VARIABLE_NON_VOLATILE | EFI_VARIABLE_APPEND_WRITE),
            vec!["efi-variable-non-volatile", "efi-variable-append-write"]
        );
    }

    #[test]
    fn utf16_names() {
        let raw = utf16::encode("test", true).unwrap();
        assert_eq!(raw, b"t\0e\0s\0t\0\0\0");
        assert_eq!(utf16::decode(&raw).unwrap(), "test");
        // Not terminated on disk.
        assert_eq!(utf16::decode(b"t\0e\0").unwrap(), "te");
        assert_eq!(utf16::encode("te", false).unwrap(), b"t\0e\0");
        assert_eq!(
            utf16::decode(&utf16::encode("h\u{e9}\u{1f600}", true).unwrap()).unwrap(),
            "h\u{e9}\u{1f600}"
        );
    }

    #[test]
    fn utf16_errors() {
        assert!(matches!(utf16::decode(b"t\0e"), Err(Error::Encoding(_))));
        // Lone high surrogate.
        assert!(matches!(utf16::decode(&[0x00, 0xd8, 0x41, 0x00]), Err(Error::Encoding(_))));
        assert!(matches!(utf16::encode("a\0b", true), Err(Error::Encoding(_))));
    }

    proptest! {
        #[test]
        fn guid_string_round_trip(raw in any::<[u8; 16]>()) {
            let guid = EfiGuid::from_bytes(&raw).unwrap();
            let parsed: EfiGuid = guid.to_string().parse().unwrap();
            prop_assert_eq!(parsed, guid);
            prop_assert_eq!(parsed.to_bytes().unwrap(), raw);
        }
    }
}
