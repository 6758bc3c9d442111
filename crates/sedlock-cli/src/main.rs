//! sedlock command-line interface: unlock and manage self-encrypting USB drives.

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use sedlock_core::kdf::derive_blob;
use sedlock_core::{
    logging, Cipher, CredentialOverrides, DeviceController, DeviceInfo, DiagnosticReport,
    Disposition, EraseOptions, KdfOverride, KdfParams, ReportLevel, SedError, SedlockConfig,
    SessionSettings, SleepTimer,
};
use sedlock_device::SystemTransport;
use serde_json::to_string_pretty;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "/etc/sedlock.toml";

#[derive(Parser, Debug)]
#[command(
    name = "sedlock",
    version,
    about = "Unlock and manage hardware-encrypted USB drives."
)]
struct Cli {
    /// Path to the sedlock configuration file; built-in defaults apply when it is absent.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Drive to operate on (e.g. /dev/sdb); defaults to the first listed drive.
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attachable drives.
    List,

    /// Show the security status of the drive.
    Status,

    /// Show cipher, key-derivation parameters and hint of the drive.
    Info,

    /// Print the stored password hint.
    Hint,

    /// Unlock the drive with its user password.
    Unlock {
        /// Password; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Unlock the drive with a password blob read from FILE, or stdin when omitted.
    UnlockBlob { file: Option<PathBuf> },

    /// Print or save the password blob for a password.
    ///
    /// With --cipher no drive is touched and the configured default salt applies.
    GenerateBlob {
        /// Password; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,

        /// Derive for this cipher instead of asking the drive.
        #[arg(long)]
        cipher: Option<String>,

        /// Write the blob here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Configure a user password on a drive without one.
    SetPassword {
        /// Hint stored on the drive (at most 100 characters).
        #[arg(long, default_value = "")]
        hint: String,

        /// Salt for the new password (at most four characters).
        #[arg(long)]
        new_salt: Option<String>,

        /// Iteration count for the new password.
        #[arg(long)]
        new_iteration_count: Option<u32>,
    },

    /// Remove the user password from an unlocked drive.
    RemovePassword {
        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Change the user password of an unlocked drive.
    ChangePassword {
        /// Hint stored alongside the new password.
        #[arg(long, default_value = "")]
        hint: String,

        /// Salt the current password was set with.
        #[arg(long)]
        old_salt: Option<String>,

        /// Iteration count the current password was set with.
        #[arg(long)]
        old_iteration_count: Option<u32>,

        /// Salt for the new password.
        #[arg(long)]
        new_salt: Option<String>,

        /// Iteration count for the new password.
        #[arg(long)]
        new_iteration_count: Option<u32>,
    },

    /// Show or set the standby timer in minutes (0 disables).
    SleepTimer { minutes: Option<String> },

    /// Show or switch the activity LED.
    Led { state: Option<Toggle> },

    /// Show or switch the emulated CD-ROM.
    VirtualCd { state: Option<Toggle> },

    /// Run the drive's built-in self-test.
    Diagnose,

    /// Destroy the data key. Every byte on the drive becomes unreadable.
    Erase {
        /// Required acknowledgement that all data will be lost.
        #[arg(long)]
        confirm: bool,

        /// Skip the interactive confirmation.
        #[arg(long)]
        force: bool,

        /// Cipher for the new data key (e.g. aes-256-xts).
        #[arg(long)]
        cipher: Option<String>,

        /// Leave the old blocks in place instead of discarding them.
        #[arg(long)]
        no_discard: bool,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

/// Stand-ins for the salt and iteration count stored on the drive.
#[derive(Args, Debug, Default)]
struct KdfArgs {
    /// Salt (at most four characters) to use instead of the stored one.
    #[arg(long)]
    salt: Option<String>,

    /// Iteration count to use instead of the stored one.
    #[arg(long)]
    iteration_count: Option<u32>,
}

impl KdfArgs {
    fn to_override(&self) -> Result<KdfOverride> {
        Ok(KdfOverride::parse(
            self.salt.as_deref(),
            self.iteration_count,
        )?)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        if let Some(sed) = err.downcast_ref::<SedError>() {
            match sed.disposition() {
                Disposition::DisableCredentials => eprintln!(
                    "password operations are unavailable for this drive; `sedlock erase` is the only way forward"
                ),
                Disposition::Retry => eprintln!("the operation may be retried"),
                Disposition::Abort => {}
            }
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    if let Commands::Validate { file, schema } = &cli.command {
        return validate(file, *schema);
    }

    let config = load_config(&cli.config)?;

    if let Commands::GenerateBlob {
        password,
        cipher: Some(cipher),
        output,
        kdf,
    } = &cli.command
    {
        let cipher: Cipher = cipher.parse()?;
        let params = kdf.to_override()?.apply(config.default_kdf()?);
        let password = password_or_prompt(password.clone(), "Password: ")?;
        let blob = derive_blob(cipher.password_blob_len()?, &params, &password)?;
        return emit_blob(&blob, output.as_deref());
    }

    let transport = SystemTransport::from_config(&config)?;
    let controller = DeviceController::new(
        transport,
        SessionSettings::from_config(&config)?,
        config.request_timeout(),
    )?;

    if let Commands::List = cli.command {
        let drives = controller.list_drives()?;
        if drives.is_empty() {
            println!("No drives found.");
        }
        for drive in drives {
            println!(
                "{:<16} {}",
                drive.path.display(),
                if drive.name.is_empty() {
                    "(unnamed)"
                } else {
                    drive.name.as_str()
                }
            );
        }
        return Ok(());
    }

    let target = match cli.device {
        Some(path) => path,
        None => controller
            .list_drives()?
            .into_iter()
            .next()
            .map(|drive| drive.path)
            .context("no drives found; pass --device")?,
    };
    controller
        .open_device(&target)
        .with_context(|| format!("failed to open {}", target.display()))?;

    match cli.command {
        Commands::List | Commands::Validate { .. } => {}
        Commands::Status => {
            let status = controller.security_status()?;
            println!("{}: {status}", target.display());
        }
        Commands::Info => {
            print_info(&controller.device_info()?);
        }
        Commands::Hint => {
            let hint = controller.password_hint()?;
            if hint.is_empty() {
                println!("No hint stored.");
            } else {
                println!("{hint}");
            }
        }
        Commands::Unlock { password, kdf } => {
            let kdf = kdf.to_override()?;
            let password =
                password_or_prompt(password, &format!("Password for {}: ", target.display()))?;
            let status = controller.unlock_with(&password, kdf)?;
            println!("{} is now {status}.", target.display());
        }
        Commands::UnlockBlob { file } => {
            let blob = read_blob(file.as_deref())?;
            let status = controller.unlock_with_blob(&blob)?;
            println!("{} is now {status}.", target.display());
        }
        Commands::GenerateBlob {
            password,
            output,
            kdf,
            ..
        } => {
            let kdf = kdf.to_override()?;
            let password = password_or_prompt(password, "Password: ")?;
            let blob = controller.password_blob(&password, kdf)?;
            emit_blob(&blob, output.as_deref())?;
        }
        Commands::SetPassword {
            hint,
            new_salt,
            new_iteration_count,
        } => {
            let kdf = KdfOverride::parse(new_salt.as_deref(), new_iteration_count)?;
            if !kdf.is_empty() {
                warn!("custom salt or iteration count; the vendor tool will not unlock this drive");
            }
            let password = prompt_new_password()?;
            let status = controller.set_password_with(&password, &hint, kdf)?;
            println!("Password set; {} is now {status}.", target.display());
        }
        Commands::RemovePassword { kdf } => {
            let kdf = kdf.to_override()?;
            let current = prompt_password("Current password: ")?;
            let status = controller.remove_password_with(&current, kdf)?;
            println!("Password removed; {} is now {status}.", target.display());
        }
        Commands::ChangePassword {
            hint,
            old_salt,
            old_iteration_count,
            new_salt,
            new_iteration_count,
        } => {
            let overrides = CredentialOverrides {
                current: KdfOverride::parse(old_salt.as_deref(), old_iteration_count)?,
                new: KdfOverride::parse(new_salt.as_deref(), new_iteration_count)?,
            };
            let current = prompt_password("Current password: ")?;
            let new_password = prompt_new_password()?;
            controller.change_password_with(&current, &new_password, &hint, overrides)?;
            println!("Password changed.");
        }
        Commands::SleepTimer { minutes } => {
            if let Some(minutes) = minutes {
                let timer: SleepTimer = minutes.parse()?;
                controller.set_sleep_timer(timer)?;
            }
            println!("Sleep timer: {}", controller.sleep_timer()?);
        }
        Commands::Led { state } => {
            if let Some(state) = state {
                controller.set_led(state.enabled())?;
            }
            println!("LED: {}", on_off(controller.led()?));
        }
        Commands::VirtualCd { state } => {
            if let Some(state) = state {
                controller.set_virtual_cd(state.enabled())?;
            }
            println!("Virtual CD: {}", on_off(controller.virtual_cd()?));
        }
        Commands::Diagnose => {
            print_report(&controller.basic_diagnose()?);
        }
        Commands::Erase {
            confirm,
            force,
            cipher,
            no_discard,
        } => {
            ensure!(confirm, "erase destroys all data; pass --confirm to proceed");
            let cipher = cipher
                .map(|c| c.parse::<Cipher>())
                .transpose()?;
            if !force && !confirm_erase(&target)? {
                println!("Erase aborted.");
                return Ok(());
            }
            let status = controller.erase(EraseOptions {
                cipher,
                discard_blocks: no_discard.then_some(false),
            })?;
            warn!("[SL3200] data key reset on {}", target.display());
            println!("{} erased; it is now {status}.", target.display());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<SedlockConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(SedlockConfig::default());
    }
    SedlockConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn validate(file: &Path, schema: bool) -> Result<()> {
    if schema {
        let schema = schema_for!(SedlockConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(());
    }

    let cfg = SedlockConfig::parse(file)
        .with_context(|| format!("failed to read configuration from {}", file.display()))?;
    let issues = cfg.validate();
    if !issues.is_empty() {
        eprintln!("Configuration validation failed:");
        for issue in issues {
            eprintln!("  - {issue}");
        }
        std::process::exit(1);
    }
    println!("Configuration valid.");
    Ok(())
}

fn password_or_prompt(password: Option<String>, prompt: &str) -> Result<String> {
    match password {
        Some(password) => Ok(password),
        None => Ok(prompt_password(prompt)?),
    }
}

fn read_blob(file: Option<&Path>) -> Result<Vec<u8>> {
    match file {
        Some(path) => fs::read(path)
            .with_context(|| format!("failed to read password blob from {}", path.display())),
        None => {
            let mut blob = Vec::new();
            io::stdin()
                .read_to_end(&mut blob)
                .context("failed to read password blob from stdin")?;
            Ok(blob)
        }
    }
}

fn emit_blob(blob: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => fs::write(path, blob)
            .with_context(|| format!("failed to write password blob to {}", path.display())),
        None => {
            let mut stdout = io::stdout();
            stdout.write_all(blob)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn prompt_new_password() -> Result<String> {
    let first = prompt_password("New password: ")?;
    let second = prompt_password("Repeat new password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn confirm_erase(target: &Path) -> Result<bool> {
    println!("*** ERASE ***");
    println!(
        "This destroys the data key of {}; every file on it will be lost.",
        target.display()
    );
    println!("Type the device path to continue or press Enter to abort:");
    print!("> ");
    io::stdout().flush().ok();
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if Path::new(answer.trim()) != target {
        return Ok(false);
    }

    println!("Type ERASE to confirm:");
    print!("> ");
    io::stdout().flush().ok();
    let mut phrase = String::new();
    io::stdin().read_line(&mut phrase)?;
    Ok(phrase.trim() == "ERASE")
}

fn print_report(report: &DiagnosticReport) {
    println!("{}: {}", report.drive.path.display(), report.summary());
    for event in &report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn print_info(info: &DeviceInfo) {
    println!("Device:            {}", info.drive.path.display());
    println!("Product:           {}", info.product);
    println!("Status:            {}", info.status);
    println!("Cipher:            {}", info.cipher);
    let supported: Vec<String> = info
        .supported_ciphers
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("Supported ciphers: {}", supported.join(", "));
    if let Some(len) = info.blob_len {
        println!("Password blob:     {len} bytes");
    }
    let origin = if info.kdf_stored { "" } else { " (default)" };
    println!("Iteration count{origin}: {}", info.kdf.iterations);
    println!("Salt{origin}: {}", describe_salt(&info.kdf));
    println!("Hint:              {}", info.hint);
}

fn describe_salt(kdf: &KdfParams) -> String {
    let bytes = hex::encode(kdf.salt);
    match kdf.salt_text() {
        Some(text) => format!("{bytes} ({text})"),
        None => bytes,
    }
}

fn level_tag(level: ReportLevel) -> &'static str {
    match level {
        ReportLevel::Info => "INFO",
        ReportLevel::Success => "OK",
        ReportLevel::Warn => "WARN",
        ReportLevel::Error => "ERR",
        ReportLevel::Security => "SEC",
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
