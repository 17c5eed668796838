//! Well-known variables of macOS guests.

use log::{debug, warn};
use uuid::Uuid;

use crate::efi::{
    EfiGuid, APPLE_NVRAM_VARIABLE_GUID, APPLE_SCREEN_RESOLUTION_GUID, DEFAULT_ATTRIBUTES,
    DHCPV6_SERVICE_BINDING_GUID,
};
use crate::error::{Error, Result};
use crate::nvram::{Entry, EntryType, Nvram, Variable, VariableMut};
use crate::version::Version;

pub const BOOT_ARGS: &str = "boot-args";
pub const CSR_ACTIVE_CONFIG: &str = "csr-active-config";
pub const PLATFORM_UUID: &str = "platform-uuid";
pub const FMM_COMPUTER_NAME: &str = "fmm-computer-name";
pub const DHCPV6_CLIENT_ID: &str = "ClientId";
pub const SCREEN_WIDTH: &str = "width";
pub const SCREEN_HEIGHT: &str = "height";

pub const CSR_ALLOW_UNTRUSTED_KEXTS: u32            = 1 << 0;
pub const CSR_ALLOW_UNRESTRICTED_FS: u32            = 1 << 1;
pub const CSR_ALLOW_TASK_FOR_PID: u32               = 1 << 2;
pub const CSR_ALLOW_KERNEL_DEBUGGER: u32            = 1 << 3;
pub const CSR_ALLOW_APPLE_INTERNAL: u32             = 1 << 4;
pub const CSR_ALLOW_UNRESTRICTED_DTRACE: u32        = 1 << 5;
pub const CSR_ALLOW_UNRESTRICTED_NVRAM: u32         = 1 << 6;
pub const CSR_ALLOW_DEVICE_CONFIGURATION: u32       = 1 << 7;
pub const CSR_ALLOW_ANY_RECOVERY_OS: u32            = 1 << 8;
pub const CSR_ALLOW_UNAPPROVED_KEXTS: u32           = 1 << 9;
pub const CSR_ALLOW_EXECUTABLE_POLICY_OVERRIDE: u32 = 1 << 10;
pub const CSR_ALLOW_UNAUTHENTICATED_ROOT: u32       = 1 << 11;

/// Prefix of the DHCPv6 client id written by the hypervisor, followed by the
/// machine UUID.
const CLIENT_ID_PREFIX: [u8; 4] = [0x12, 0x00, 0x00, 0x04];

/*
 * Lookup
 */

/// The first entry holding EFI variables.
pub fn variables_entry(nvram: &Nvram) -> Result<&Entry> {
    nvram
        .entries()
        .find(|e| e.entry_type() == EntryType::EfiVariables)
        .ok_or(Error::NoVariablesEntry)
}

pub fn variables_entry_mut(nvram: &mut Nvram) -> Result<&mut Entry> {
    let index = nvram
        .entries()
        .position(|e| e.entry_type() == EntryType::EfiVariables)
        .ok_or(Error::NoVariablesEntry)?;

    nvram.entry_mut(index).ok_or(Error::NoVariablesEntry)
}

/// Entry and variable index of the first variable matching `guid` and
/// `name`. Variables whose name can't be decoded never match.
pub fn find_variable(nvram: &Nvram, guid: EfiGuid, name: &str) -> Option<(usize, usize)> {
    nvram
        .entries()
        .enumerate()
        .filter(|(_, e)| e.entry_type() == EntryType::EfiVariables)
        .find_map(|(i, e)| {
            e.variables()
                .position(|v| v.guid() == guid && v.utf8_name().map_or(false, |n| n == name))
                .map(|j| (i, j))
        })
}

pub fn variable<'a>(nvram: &'a Nvram, guid: EfiGuid, name: &str) -> Option<&'a Variable> {
    let (e, v) = find_variable(nvram, guid, name)?;
    nvram.entry(e)?.variable(v)
}

pub fn variable_mut<'a>(
    nvram: &'a mut Nvram,
    guid: EfiGuid,
    name: &str,
) -> Option<VariableMut<'a>> {
    let (e, v) = find_variable(nvram, guid, name)?;
    nvram.entry_mut(e)?.variable_mut(v)
}

/// Replace the value of a variable, creating it with the default attributes
/// if it does not exist yet.
pub fn set_variable(nvram: &mut Nvram, guid: EfiGuid, name: &str, value: &[u8]) -> Result<()> {
    if let Some(mut var) = variable_mut(nvram, guid, name) {
        debug!("updating {}:{}", guid, name);
        var.set_value(value);
        return Ok(());
    }

    debug!("adding {}:{}", guid, name);
    variables_entry_mut(nvram)?.add_variable(guid, DEFAULT_ATTRIBUTES, name, value)?;
    Ok(())
}

/*
 * Boot arguments
 */

pub fn set_boot_args(nvram: &mut Nvram, boot_args: &str) -> Result<()> {
    let mut value = boot_args.as_bytes().to_vec();
    value.push(0);
    set_variable(nvram, APPLE_NVRAM_VARIABLE_GUID, BOOT_ARGS, &value)
}

/*
 * System Integrity Protection
 */

fn csr_value(value: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = value.try_into().map_err(|_| Error::InvalidValueSize {
        what: "csr value",
        size: value.len(),
    })?;
    Ok(u32::from_le_bytes(raw))
}

pub fn csr_active_config(nvram: &Nvram) -> Result<u32> {
    let var = variable(nvram, APPLE_NVRAM_VARIABLE_GUID, CSR_ACTIVE_CONFIG)
        .ok_or_else(|| Error::VariableNotFound(CSR_ACTIVE_CONFIG.to_string()))?;
    csr_value(var.value())
}

pub fn set_csr_active_config(nvram: &mut Nvram, csr: u32) -> Result<()> {
    set_variable(nvram, APPLE_NVRAM_VARIABLE_GUID, CSR_ACTIVE_CONFIG, &csr.to_le_bytes())
}

struct CsrRule {
    min: Version,
    max: Version,
    apply: fn(bool, u32) -> u32,
}

const CSR_RULES: [CsrRule; 4] = [
    CsrRule {
        min: Version::new(10, 11, 0),
        max: Version::new(10, 12, 99),
        apply: csr_el_capitan,
    },
    CsrRule {
        min: Version::new(10, 13, 0),
        max: Version::new(10, 13, 99),
        apply: csr_high_sierra,
    },
    CsrRule {
        min: Version::new(10, 14, 0),
        max: Version::new(10, 15, 99),
        apply: csr_mojave,
    },
    CsrRule {
        min: Version::new(10, 16, 0),
        max: Version::new(13, 99, 99),
        apply: csr_big_sur,
    },
];

fn csr_el_capitan(enable: bool, _current: u32) -> u32 {
    if enable {
        0x10
    } else {
        0x77
    }
}

fn csr_high_sierra(enable: bool, current: u32) -> u32 {
    (current & CSR_ALLOW_UNAPPROVED_KEXTS) | csr_el_capitan(enable, current)
}

fn csr_mojave(enable: bool, current: u32) -> u32 {
    let kept = CSR_ALLOW_UNAPPROVED_KEXTS | CSR_ALLOW_EXECUTABLE_POLICY_OVERRIDE;
    (current & kept) | csr_el_capitan(enable, current)
}

fn csr_big_sur(enable: bool, current: u32) -> u32 {
    let relaxed = CSR_ALLOW_UNTRUSTED_KEXTS
        | CSR_ALLOW_UNRESTRICTED_FS
        | CSR_ALLOW_UNRESTRICTED_NVRAM
        | CSR_ALLOW_TASK_FOR_PID
        | CSR_ALLOW_UNRESTRICTED_DTRACE
        | CSR_ALLOW_KERNEL_DEBUGGER;

    if enable {
        (current & !(relaxed | CSR_ALLOW_UNAUTHENTICATED_ROOT)) | CSR_ALLOW_APPLE_INTERNAL
    } else {
        current | relaxed | CSR_ALLOW_APPLE_INTERNAL
    }
}

/// Enable or disable System Integrity Protection the way `csrutil` does on
/// the given macOS release, and return the new `csr-active-config` value.
/// Without a version the rules of the latest known release are used.
pub fn set_csr_activation(nvram: &mut Nvram, version: Option<Version>, enable: bool) -> Result<u32> {
    let apply = match version {
        Some(v) => CSR_RULES
            .iter()
            .find(|r| r.min <= v && v <= r.max)
            .map(|r| r.apply)
            .ok_or(Error::UnsupportedVersion(v))?,
        None => {
            warn!("no macOS version given, using the rules of the latest release");
            csr_big_sur
        }
    };

    if find_variable(nvram, APPLE_NVRAM_VARIABLE_GUID, CSR_ACTIVE_CONFIG).is_none() {
        set_csr_active_config(nvram, 0)?;
    }

    let csr = apply(enable, csr_active_config(nvram)?);
    set_csr_active_config(nvram, csr)?;
    Ok(csr)
}

/// Names of the SIP relaxations set in `csr`.
pub fn csr_flag_names(csr: u32) -> Vec<&'static str> {
    const NAMES: [(u32, &str); 12] = [
        (CSR_ALLOW_UNTRUSTED_KEXTS, "allow-untrusted-kexts"),
        (CSR_ALLOW_UNRESTRICTED_FS, "allow-unrestricted-fs"),
        (CSR_ALLOW_TASK_FOR_PID, "allow-task-for-pid"),
        (CSR_ALLOW_KERNEL_DEBUGGER, "allow-kernel-debugger"),
        (CSR_ALLOW_APPLE_INTERNAL, "allow-apple-internal"),
        (CSR_ALLOW_UNRESTRICTED_DTRACE, "allow-unrestricted-dtrace"),
        (CSR_ALLOW_UNRESTRICTED_NVRAM, "allow-unrestricted-nvram"),
        (CSR_ALLOW_DEVICE_CONFIGURATION, "allow-device-configuration"),
        (CSR_ALLOW_ANY_RECOVERY_OS, "allow-any-recovery-os"),
        (CSR_ALLOW_UNAPPROVED_KEXTS, "allow-unapproved-kexts"),
        (CSR_ALLOW_EXECUTABLE_POLICY_OVERRIDE, "allow-executable-policy-override"),
        (CSR_ALLOW_UNAUTHENTICATED_ROOT, "allow-unauthenticated-root"),
    ];

    NAMES
        .iter()
        .filter(|(bit, _)| csr & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/*
 * Machine identity
 */

pub fn platform_uuid(nvram: &Nvram) -> Result<Uuid> {
    let var = variable(nvram, APPLE_NVRAM_VARIABLE_GUID, PLATFORM_UUID)
        .ok_or_else(|| Error::VariableNotFound(PLATFORM_UUID.to_string()))?;

    Uuid::from_slice(var.value()).map_err(|_| Error::InvalidValueSize {
        what: "platform uuid",
        size: var.value().len(),
    })
}

pub fn set_platform_uuid(nvram: &mut Nvram, uuid: &Uuid) -> Result<()> {
    set_variable(nvram, APPLE_NVRAM_VARIABLE_GUID, PLATFORM_UUID, uuid.as_bytes())
}

/// Set the platform UUID and, when the guest has one, the DHCPv6 client id
/// derived from it.
pub fn set_machine_uuid(nvram: &mut Nvram, uuid: &Uuid) -> Result<()> {
    set_platform_uuid(nvram, uuid)?;

    if let Some(mut var) = variable_mut(nvram, DHCPV6_SERVICE_BINDING_GUID, DHCPV6_CLIENT_ID) {
        let mut client_id = CLIENT_ID_PREFIX.to_vec();
        client_id.extend_from_slice(uuid.as_bytes());
        var.set_value(&client_id);
    }

    Ok(())
}

/*
 * Display
 */

pub fn set_screen_resolution(nvram: &mut Nvram, width: u32, height: u32) -> Result<()> {
    set_variable(nvram, APPLE_SCREEN_RESOLUTION_GUID, SCREEN_WIDTH, &width.to_le_bytes())?;
    set_variable(nvram, APPLE_SCREEN_RESOLUTION_GUID, SCREEN_HEIGHT, &height.to_le_bytes())
}

fn upper_uuid(bytes: &[u8]) -> Option<String> {
    Uuid::from_slice(bytes)
        .ok()
        .map(|u| u.hyphenated().to_string().to_uppercase())
}

/// Human readable form of the value of a well-known variable.
pub fn decoded_value(var: &Variable) -> Option<String> {
    let name = var.utf8_name().ok()?;
    let value = var.value();

    match (var.guid(), name) {
        (APPLE_NVRAM_VARIABLE_GUID, CSR_ACTIVE_CONFIG) => {
            let csr = csr_value(value).ok()?;
            Some(format!("{:#x} [{}]", csr, csr_flag_names(csr).join(", ")))
        }
        (APPLE_NVRAM_VARIABLE_GUID, PLATFORM_UUID) => upper_uuid(value),
        (APPLE_NVRAM_VARIABLE_GUID, BOOT_ARGS | FMM_COMPUTER_NAME) => {
            let text = value.split(|&b| b == 0).next().unwrap_or_default();
            Some(String::from_utf8_lossy(text).into_owned())
        }
        (APPLE_SCREEN_RESOLUTION_GUID, SCREEN_WIDTH | SCREEN_HEIGHT) => {
            let raw: [u8; 4] = value.try_into().ok()?;
            Some(format!("{} px", u32::from_le_bytes(raw)))
        }
        (DHCPV6_SERVICE_BINDING_GUID, DHCPV6_CLIENT_ID) => value
            .strip_prefix(&CLIENT_ID_PREFIX[..])
            .and_then(upper_uuid),
        _ => None,
    }
}
