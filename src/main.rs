use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use log::{debug, info, warn, LevelFilter};
use serde::Serialize;
use uuid::Uuid;

#[macro_use]
extern crate lazy_static;

use vm_config::efi::{self, EfiGuid};
use vm_config::helper;
use vm_config::nvram::{Entry, EntryType, Nvram, Variable};
use vm_config::version::Version;
use vm_config::vmx::{self, Line, Vmx};

const EXIT_FAILURE: i32 = 1;
const EXIT_INVALID_VM: i32 = 3;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Increase verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Produce debugging output
    #[clap(short, long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the configuration of a virtual machine
    Show(ShowArgs),
    /// Change the configuration of a virtual machine
    Change(ChangeArgs),
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Virtual machine bundle
    #[clap(value_name = "vm")]
    vm: PathBuf,

    /// Show everything
    #[clap(short, long)]
    all: bool,

    /// Show the vmx entries
    #[clap(long)]
    vmx: bool,

    /// Show the nvram entries
    #[clap(long)]
    nvram: bool,

    /// Show the EFI variables (default)
    #[clap(long)]
    nvram_efi_variables: bool,

    /// Show only the EFI variables named <name>
    #[clap(long, value_name = "name")]
    nvram_efi_variable: Option<String>,

    /// Print the EFI variables as JSON
    #[clap(long)]
    json: bool,
}

#[derive(Args, Debug)]
#[clap(group(ArgGroup::new("csr").args([
    "csr_enable", "csr_enable_version", "csr_disable", "csr_disable_version", "csr_flags",
])))]
#[clap(group(ArgGroup::new("changes").required(true).multiple(true).args([
    "boot_args", "csr_enable", "csr_enable_version", "csr_disable", "csr_disable_version",
    "csr_flags", "machine_uuid", "screen_resolution",
])))]
struct ChangeArgs {
    /// Virtual machine bundle
    #[clap(value_name = "vm")]
    vm: PathBuf,

    /// Set the kernel boot arguments
    #[clap(long, value_name = "args", allow_hyphen_values = true)]
    boot_args: Option<String>,

    /// Enable System Integrity Protection
    #[clap(long)]
    csr_enable: bool,

    /// Enable System Integrity Protection the way macOS <version> does
    #[clap(long, value_name = "version", value_parser = parse_version)]
    csr_enable_version: Option<Version>,

    /// Disable System Integrity Protection
    #[clap(long)]
    csr_disable: bool,

    /// Disable System Integrity Protection the way macOS <version> does
    #[clap(long, value_name = "version", value_parser = parse_version)]
    csr_disable_version: Option<Version>,

    /// Set csr-active-config to <flags>
    #[clap(long, value_name = "flags", value_parser = parse_flags)]
    csr_flags: Option<u32>,

    /// Set the machine UUID (vmx and platform UUID)
    #[clap(long, value_name = "uuid")]
    machine_uuid: Option<Uuid>,

    /// Set the screen resolution, e.g. 1920x1080
    #[clap(long, value_name = "WxH")]
    screen_resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resolution {
    width: u32,
    height: u32,
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let invalid = || format!("invalid screen resolution '{}'", s);
        let (w, h) = s.split_once('x').ok_or_else(invalid)?;
        let digits = |v: &str| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit());

        if !digits(w) || !digits(h) {
            return Err(invalid());
        }

        Ok(Resolution {
            width: w.parse().map_err(|_| invalid())?,
            height: h.parse().map_err(|_| invalid())?,
        })
    }
}

fn parse_version(s: &str) -> std::result::Result<Version, String> {
    s.parse().map_err(|e: vm_config::Error| e.to_string())
}

fn parse_flags(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid csr flags '{}'", s))
}

/// Attached to errors caused by a missing or unreadable bundle.
#[derive(Debug)]
struct InvalidVm;

impl fmt::Display for InvalidVm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid virtual machine bundle")
    }
}

/// A virtual machine directory. The vmx and nvram files are loaded on
/// first use.
struct Bundle {
    path: PathBuf,
    vmx: Option<Vmx>,
    nvram: Option<Nvram>,
}

impl Bundle {
    fn new(path: &Path) -> Self {
        Bundle {
            path: path.to_path_buf(),
            vmx: None,
            nvram: None,
        }
    }

    fn vmx_path(&self) -> Result<PathBuf> {
        let dir = fs::read_dir(&self.path)
            .with_context(|| format!("can't open {}", self.path.display()))?;

        let mut candidates = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "vmx") {
                candidates.push(path);
            }
        }
        candidates.sort();

        candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("can't find a vmx file in {}", self.path.display()))
    }

    fn vmx(&mut self) -> Result<&mut Vmx> {
        let vmx = match self.vmx.take() {
            Some(vmx) => vmx,
            None => {
                let path = self.vmx_path().context(InvalidVm)?;
                debug!("using {}", path.display());
                Vmx::open(&path).context(InvalidVm)?
            }
        };
        Ok(self.vmx.insert(vmx))
    }

    fn nvram(&mut self) -> Result<&mut Nvram> {
        let nvram = match self.nvram.take() {
            Some(nvram) => nvram,
            None => {
                let name = self
                    .vmx()?
                    .get_string_value(vmx::NVRAM_KEY)
                    .ok_or_else(|| anyhow!("can't find the nvram file key"))
                    .context(InvalidVm)?
                    .to_string();
                let path = self.path.join(name);
                debug!("using {}", path.display());
                Nvram::open(&path).context(InvalidVm)?
            }
        };
        Ok(self.nvram.insert(nvram))
    }

    fn write_temporaries(&mut self, tag: &Uuid, pending: &mut Vec<(PathBuf, PathBuf)>) -> Result<()> {
        if let Some(vmx) = self.vmx.as_ref().filter(|v| v.is_modified()) {
            let tmp = self.path.join(format!("._{}.vmx", tag));
            vmx.write_to_file(&tmp)?;
            pending.push((tmp, vmx.path().to_path_buf()));
        }

        if let Some(nvram) = self.nvram.as_mut().filter(|n| n.is_modified()) {
            let tmp = self.path.join(format!("._{}.nvram", tag));
            nvram.write_to_file(&tmp)?;
            pending.push((tmp, nvram.path().to_path_buf()));
        }

        Ok(())
    }

    /// Write the modified files next to the originals, then move them in
    /// place.
    fn save(&mut self) -> Result<()> {
        let tag = Uuid::new_v4();
        let mut pending = Vec::new();

        let result = self.write_temporaries(&tag, &mut pending).and_then(|_| {
            for (tmp, dst) in &pending {
                fs::rename(tmp, dst).with_context(|| {
                    format!("failed to replace {} with {}", dst.display(), tmp.display())
                })?;
                info!("updated {}", dst.display());
            }
            Ok(())
        });

        if result.is_err() {
            for (tmp, _) in &pending {
                if tmp.exists() {
                    if let Err(e) = fs::remove_file(tmp) {
                        warn!("can't remove {}: {}", tmp.display(), e);
                    }
                }
            }
        }

        result
    }
}

lazy_static! {
    static ref HEXDUMPER: rhexdump::Rhexdump = {
        let mut rhx = rhexdump::Rhexdump::default();
        rhx.display_duplicate_lines(false);
        rhx
    };
}

fn dump(bytes: &[u8]) {
    if !bytes.is_empty() {
        print!("{}\n", HEXDUMPER.hexdump(bytes));
    }
}

fn display_vmx(vmx: &Vmx) {
    let lines: Vec<&Line> = vmx.lines().collect();
    println!("-- VMX ({} entries) --", lines.len());

    for (i, line) in lines.into_iter().enumerate() {
        print!("[{}] ", i);
        match line {
            Line::Empty => println!("Type: empty-line"),
            Line::Comment(comment) => {
                println!("Type: comment");
                println!("  > value = '{}'", comment);
            }
            Line::KeyValue { key, value } => {
                println!("Type: key-value");
                println!("  > key   = {}", key);
                println!("  > value = {}", value);
            }
        }
    }
    println!();
}

fn display_var(v: &Variable, verbose: bool) {
    let guid = v.guid();
    match guid.known_name() {
        Some(name) => println!("    GUID {} ({})", guid, name),
        None => println!("    GUID {}", guid),
    }

    println!("       Attributes: {:#x} ({})", v.attributes(),
        efi::attributes_summary(v.attributes()));
    if verbose {
        for name in efi::attribute_names(v.attributes()) {
            println!("           {}", name);
        }
    }

    match v.utf8_name() {
        Ok(name) => println!("       Name: {}", name),
        Err(_) => {
            println!("       Name:");
            dump(v.name());
        }
    }

    let decoded = helper::decoded_value(v);
    if let Some(decoded) = &decoded {
        println!("       Value: {}", decoded);
    }
    if verbose || decoded.is_none() {
        println!("       Value ({} bytes):", v.value().len());
        dump(v.value());
    }
    println!();
}

fn display_entry(entry: &Entry, verbose: bool, filter: Option<&str>) {
    match entry.subname() {
        s if s.is_empty() => println!("{}", entry.name()),
        s => println!("{} - {}", entry.name(), s),
    }

    match entry.entry_type() {
        EntryType::EfiVariables => {
            println!(" > Variables: {}", entry.variables_count());
            for v in entry.variables() {
                if let Some(name) = filter {
                    if v.utf8_name().map_or(true, |n| n != name) {
                        continue;
                    }
                }
                display_var(v, verbose);
            }
        }
        EntryType::Generic => {
            println!(" > Size : {}", entry.content_bytes().len());
            if verbose {
                println!(" > Bytes:");
                dump(entry.content_bytes());
            }
        }
    }
    println!();
}

#[derive(Serialize)]
struct JsonVariable<'a> {
    entry: String,
    guid: EfiGuid,
    guid_name: Option<&'static str>,
    attributes: u32,
    attribute_names: Vec<&'static str>,
    name: Option<&'a str>,
    value: String,
    decoded: Option<String>,
}

fn json_variables<'a>(nvram: &'a Nvram, filter: Option<&str>) -> Vec<JsonVariable<'a>> {
    nvram
        .entries()
        .filter(|e| e.entry_type() == EntryType::EfiVariables)
        .flat_map(|e| e.variables().map(move |v| (e, v)))
        .filter(|(_, v)| filter.map_or(true, |f| v.utf8_name().map_or(false, |n| n == f)))
        .map(|(e, v)| JsonVariable {
            entry: e.name().into_owned(),
            guid: v.guid(),
            guid_name: v.guid().known_name(),
            attributes: v.attributes(),
            attribute_names: efi::attribute_names(v.attributes()),
            name: v.utf8_name().ok(),
            value: v.value().iter().map(|b| format!("{:02x}", b)).collect(),
            decoded: helper::decoded_value(v),
        })
        .collect()
}

fn show(args: &ShowArgs, verbose: bool) -> Result<()> {
    let mut bundle = Bundle::new(&args.vm);
    let filter = args.nvram_efi_variable.as_deref();

    if args.json {
        let nvram = bundle.nvram()?;
        let vars = json_variables(nvram, filter);
        if filter.is_some() && vars.is_empty() {
            bail!("variable '{}' not found", filter.unwrap_or_default());
        }
        println!("{}", serde_json::to_string_pretty(&vars)?);
        return Ok(());
    }

    let selected = args.vmx || args.nvram || args.nvram_efi_variables || filter.is_some();

    if args.all || args.vmx {
        display_vmx(bundle.vmx()?);
    }

    if args.all || args.nvram {
        let nvram = bundle.nvram()?;
        println!("-- NVRAM ({} entries) --", nvram.entries_count());
        for entry in nvram.entries() {
            display_entry(entry, verbose, None);
        }
    } else if args.nvram_efi_variables || filter.is_some() || !selected {
        let nvram = bundle.nvram()?;
        if let Some(name) = filter {
            if !json_variables(nvram, filter).iter().any(|v| v.name == Some(name)) {
                bail!("variable '{}' not found", name);
            }
        }
        println!("-- NVRAM EFI Variables --");
        for entry in nvram.entries().filter(|e| e.entry_type() == EntryType::EfiVariables) {
            display_entry(entry, verbose, filter);
        }
    }

    Ok(())
}

fn change(args: &ChangeArgs) -> Result<()> {
    let mut bundle = Bundle::new(&args.vm);

    if let Some(boot_args) = &args.boot_args {
        helper::set_boot_args(bundle.nvram()?, boot_args)?;
        info!("boot-args set to '{}'", boot_args);
    }

    let csr = match (args.csr_enable_version, args.csr_disable_version) {
        _ if args.csr_enable => Some((true, None)),
        _ if args.csr_disable => Some((false, None)),
        (Some(v), _) => Some((true, Some(v))),
        (_, Some(v)) => Some((false, Some(v))),
        _ => None,
    };

    if let Some((enable, version)) = csr {
        let value = helper::set_csr_activation(bundle.nvram()?, version, enable)?;
        info!("csr-active-config set to {:#x}", value);
    }

    if let Some(flags) = args.csr_flags {
        helper::set_csr_active_config(bundle.nvram()?, flags)?;
        info!("csr-active-config set to {:#x}", flags);
    }

    if let Some(uuid) = &args.machine_uuid {
        if !bundle.vmx()?.set_machine_uuid(uuid) {
            debug!("no uuid keys in the vmx file");
        }
        helper::set_machine_uuid(bundle.nvram()?, uuid)?;
        info!("machine uuid set to {}", uuid);
    }

    if let Some(res) = &args.screen_resolution {
        helper::set_screen_resolution(bundle.nvram()?, res.width, res.height)?;
        info!("screen resolution set to {}x{}", res.width, res.height);
    }

    bundle.save()?;
    println!("Virtual machine configuration changed with success.");

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let result = match &cli.command {
        Command::Show(args) => show(args, cli.verbose || cli.debug),
        Command::Change(args) => change(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        let code = if e.downcast_ref::<InvalidVm>().is_some() {
            EXIT_INVALID_VM
        } else {
            EXIT_FAILURE
        };
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const VMX: &str = "\
.encoding = \"UTF-8\"
nvram = \"vm.nvram\"
uuid.bios = \"00 00 00 00 00 00 00 00-00 00 00 00 00 00 00 00\"
";

    fn nvram_bytes() -> Vec<u8> {
        let mut store = b"VMWNVRAM\0\0\0\0".to_vec();
        store.extend_from_slice(&16u32.to_le_bytes());

        let mut bytes = b"MRVN\x01\x00\x00\x00EFI_NV\0\0".to_vec();
        bytes.extend_from_slice(&(store.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&store);
        bytes
    }

    fn bundle_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vm.vmx"), VMX).unwrap();
        fs::write(dir.path().join("vm.nvram"), nvram_bytes()).unwrap();
        dir
    }

    fn change_args(vm: &Path, extra: &[&str]) -> ChangeArgs {
        let mut argv = vec!["vm-config", "change", vm.to_str().unwrap()];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Change(args) => args,
            c => panic!("unexpected command {:?}", c),
        }
    }

    #[test]
    fn cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_arguments() {
        assert!(Cli::try_parse_from(["vm-config", "change", "vm"]).is_err());
        assert!(Cli::try_parse_from(
            ["vm-config", "change", "vm", "--csr-enable", "--csr-disable"]).is_err());
        assert!(Cli::try_parse_from(
            ["vm-config", "change", "vm", "--screen-resolution", "1920"]).is_err());
        assert!(Cli::try_parse_from(
            ["vm-config", "change", "vm", "--machine-uuid", "nope"]).is_err());
        assert!(Cli::try_parse_from(
            ["vm-config", "change", "vm", "--csr-enable-version", "10.15"]).is_err());

        let args = change_args(Path::new("vm"), &[
            "--csr-flags", "0x67", "--screen-resolution", "1920x1080", "--boot-args", "-v",
        ]);
        assert_eq!(args.csr_flags, Some(0x67));
        assert_eq!(args.screen_resolution, Some(Resolution { width: 1920, height: 1080 }));
        assert_eq!(args.boot_args.as_deref(), Some("-v"));

        let cli = Cli::try_parse_from([
            "vm-config", "change", "vm", "--boot-args", "-v keepsyms=1", "--csr-disable",
        ]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Command::Change(args) => {
                assert_eq!(args.boot_args.as_deref(), Some("-v keepsyms=1"));
                assert!(args.csr_disable);
            }
            c => panic!("unexpected command {:?}", c),
        }

        let cli = Cli::try_parse_from(["vm-config", "-v", "change", "vm", "--boot-args", "-s"])
            .unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn values() {
        assert_eq!(parse_flags("103"), Ok(103));
        assert_eq!(parse_flags("0X7f"), Ok(0x7f));
        assert!(parse_flags("0xg").is_err());
        assert!("1920x".parse::<Resolution>().is_err());
        assert!("-1x5".parse::<Resolution>().is_err());
        assert_eq!(
            "800x600".parse::<Resolution>(),
            Ok(Resolution { width: 800, height: 600 })
        );
    }

    #[test]
    fn change_bundle() {
        let dir = bundle_dir();
        let args = change_args(dir.path(), &[
            "--boot-args", "-v keepsyms=1",
            "--csr-disable-version", "10.15.7",
            "--machine-uuid", "564d5a6c-1f0e-4a3b-9c2d-7e8f90a1b2c3",
        ]);
        change(&args).unwrap();

        let nvram = Nvram::open(dir.path().join("vm.nvram")).unwrap();
        assert_eq!(helper::csr_active_config(&nvram).unwrap(), 0x77);
        assert_eq!(
            helper::platform_uuid(&nvram).unwrap().to_string(),
            "564d5a6c-1f0e-4a3b-9c2d-7e8f90a1b2c3"
        );

        let vmx = Vmx::open(dir.path().join("vm.vmx")).unwrap();
        assert_eq!(
            vmx.get_string_value(vmx::UUID_BIOS_KEY),
            Some("56 4d 5a 6c 1f 0e 4a 3b-9c 2d 7e 8f 90 a1 b2 c3")
        );

        // Temporaries are gone.
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("._")), "{:?}", names);
    }

    #[test]
    fn unmodified_vmx_is_not_rewritten() {
        let dir = bundle_dir();
        change(&change_args(dir.path(), &["--screen-resolution", "1024x768"])).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("vm.vmx")).unwrap(), VMX);
        assert_ne!(fs::read(dir.path().join("vm.nvram")).unwrap(), nvram_bytes());
    }

    #[test]
    fn invalid_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let err = change(&change_args(dir.path(), &["--boot-args", "-v"])).unwrap_err();
        assert!(err.downcast_ref::<InvalidVm>().is_some());

        fs::write(dir.path().join("vm.vmx"), "a = \"b\"\n").unwrap();
        let err = change(&change_args(dir.path(), &["--boot-args", "-v"])).unwrap_err();
        assert!(err.downcast_ref::<InvalidVm>().is_some());
        assert!(format!("{:#}", err).contains("nvram file key"));
    }

    #[test]
    fn failed_replace_removes_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vm.vmx");
        fs::create_dir(&target).unwrap();

        let mut vmx = Vmx::parse(&target, VMX).unwrap();
        vmx.set_value("displayName", "x");
        let mut bundle = Bundle::new(dir.path());
        bundle.vmx = Some(vmx);

        assert!(bundle.save().is_err());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["vm.vmx".to_string()]);
    }

    #[test]
    fn helper_failure_is_not_invalid_bundle() {
        let dir = bundle_dir();
        let err = change(&change_args(dir.path(), &["--csr-enable-version", "9.0.0"]))
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidVm>().is_none());
        assert_eq!(fs::read(dir.path().join("vm.nvram")).unwrap(), nvram_bytes());
    }
}
