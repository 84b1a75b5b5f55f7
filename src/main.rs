//! `peakjob` command line: launch centroiding jobs and collect their results.

use std::{
    collections::BTreeSet,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use clap::{ArgAction, Parser, Subcommand};
use peakjob::{
    checksum::{ChecksummedFile, Verification, seal_text_file},
    config::{self, AppConfig},
    credentials::{AccountCredentials, CredentialStore},
    logging::{self, Verbosity},
    scan::{Peak, Scan, read_scan_file},
    service::CentroidService,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const PASSWORD_ENV: &str = "PEAKJOB_PASSWORD";

#[derive(Parser)]
#[command(name = "peakjob", version, about = "Remote centroiding job client")]
struct Cli {
    /// More console output; repeat for trace level.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the account password and remember the account in the config.
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        account_id: u32,
    },
    /// Forget the stored password.
    Logout,
    /// Bundle scan files into a new job and start it.
    Launch {
        /// Data set name recorded with the job.
        #[arg(long)]
        target: String,
        /// Scan numbers to send; all scans when omitted.
        #[arg(long, value_delimiter = ',')]
        select: Vec<u32>,
        #[arg(required = true)]
        scans: Vec<PathBuf>,
    },
    /// Wait for a launched job and write the centroided scans.
    Retrieve {
        /// Job name, e.g. `vpi-123[1..40]`.
        job: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(required = true)]
        scans: Vec<PathBuf>,
    },
    /// List launched jobs awaiting retrieval.
    Jobs,
    /// Check the embedded checksum of text files.
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    let verbosity = match cli.verbose {
        0 => Verbosity::Normal,
        1 => Verbosity::Verbose,
        _ => Verbosity::Trace,
    };
    if let Err(err) = logging::init(verbosity) {
        eprintln!("Logging disabled: {err}");
    }
    match run(cli.command) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}

/// Returns `false` when the command ran but found problems.
fn run(command: Command) -> CliResult<bool> {
    let mut config = config::load_or_default()?;
    match command {
        Command::Login {
            username,
            account_id,
        } => {
            let password = read_password(&username)?;
            CredentialStore::new()?.set_password(&username, &password)?;
            config.account.username = Some(username);
            config.account.account_id = Some(account_id);
            config::save(&config)?;
            println!("Credentials stored.");
            Ok(true)
        }
        Command::Logout => {
            if let Some(username) = &config.account.username {
                CredentialStore::new()?.delete(username)?;
            }
            println!("Credentials removed.");
            Ok(true)
        }
        Command::Launch {
            target,
            select,
            scans,
        } => launch(&config, &target, &select, &scans),
        Command::Retrieve { job, out, scans } => retrieve(&config, &job, &out, &scans),
        Command::Jobs => {
            let service = CentroidService::from_config(&config)?;
            let pending = service.list_pending_jobs();
            if pending.is_empty() {
                println!("No pending jobs.");
            }
            for job in pending {
                println!("{}\t{}\t{}\t{}", job.pickup_name, job.status, job.scans, job.target);
            }
            Ok(true)
        }
        Command::Verify { files } => Ok(verify(&files)),
    }
}

fn launch(config: &AppConfig, target: &str, select: &[u32], paths: &[PathBuf]) -> CliResult<bool> {
    let scans = load_scans(paths)?;
    let selected: BTreeSet<u32> = select.iter().copied().collect();
    let service = CentroidService::from_config(config)?;
    let job_id = service.start_job(&scans, target, None, account(config)?)?;
    for scan in &scans {
        let chosen = selected.is_empty() || selected.contains(&scan.number);
        service.process_scan(&job_id, scan, chosen)?;
    }
    service.finish_job(&job_id)?;
    let pickup = service
        .list_pending_jobs()
        .into_iter()
        .find(|job| job.job_id == job_id)
        .map_or(job_id, |job| job.pickup_name);
    println!("Launched {pickup}");
    Ok(true)
}

fn retrieve(config: &AppConfig, job: &str, out: &Path, paths: &[PathBuf]) -> CliResult<bool> {
    let scans = load_scans(paths)?;
    std::fs::create_dir_all(out)?;
    let target = out.display().to_string();
    let service = CentroidService::from_config(config)?;
    let job_id = service.start_job(&scans, &target, Some(job), account(config)?)?;
    let mut clean = true;
    for scan in &scans {
        match service.process_scan(&job_id, scan, true) {
            Ok(Some(peaks)) => {
                let path = write_centroids(out, scan, &peaks)?;
                println!("{}: {} peaks", path.display(), peaks.len());
            }
            Ok(None) => println!("scan {}: no result", scan.number),
            Err(peakjob::service::ServiceError::Job(err)) if err.is_scan_scoped() => {
                eprintln!("{err}");
                clean = false;
            }
            Err(err) => return Err(err.into()),
        }
    }
    service.finish_job(&job_id)?;
    Ok(clean)
}

fn verify(files: &[PathBuf]) -> bool {
    let mut all_valid = true;
    for path in files {
        let verdict = match ChecksummedFile::new(path).verify() {
            Ok(Verification::Valid) => "valid".to_string(),
            Ok(Verification::Invalid { claimed: None, .. }) => {
                all_valid = false;
                "no checksum".to_string()
            }
            Ok(Verification::Invalid { .. }) => {
                all_valid = false;
                "INVALID".to_string()
            }
            Ok(Verification::Missing) => {
                all_valid = false;
                "missing".to_string()
            }
            Err(err) => {
                all_valid = false;
                err.to_string()
            }
        };
        println!("{}: {verdict}", path.display());
    }
    all_valid
}

fn load_scans(paths: &[PathBuf]) -> CliResult<Vec<Scan>> {
    let mut scans = paths
        .iter()
        .map(|path| read_scan_file(path))
        .collect::<Result<Vec<_>, _>>()?;
    scans.sort_by_key(|scan| scan.number);
    Ok(scans)
}

fn account(config: &AppConfig) -> CliResult<AccountCredentials> {
    let (Some(username), Some(account_id)) = (&config.account.username, config.account.account_id)
    else {
        return Err("No account configured; run `peakjob login` first".into());
    };
    CredentialStore::new()?
        .account(username, account_id)?
        .ok_or_else(|| format!("No password stored for {username}; run `peakjob login`").into())
}

fn read_password(username: &str) -> CliResult<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    print!("Password for {username}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err("Empty password".into());
    }
    Ok(password)
}

fn write_centroids(out: &Path, scan: &Scan, peaks: &[Peak]) -> CliResult<PathBuf> {
    let path = out.join(scan.result_name());
    let mut text = format!("# scan: {}\n# ms_level: {}\n", scan.number, scan.ms_level);
    for peak in peaks {
        text.push_str(&format!("{}\t{}\n", peak.mass, peak.intensity));
    }
    std::fs::write(&path, text)?;
    seal_text_file(&path)?;
    Ok(path)
}
