//! The end-to-end run: merge the split bundle, decompile, patch, rebuild
//! and sign, driving the Java tools through a `CommandRunner`.

use crate::config::ResolvedConfig;
use crate::libs::LibrarySettings;
use crate::patcher::{PatchOutcome, Patcher};
use crate::report::LogReporter;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;

const BASE_APK: &str = "base.apk";
const MERGED_APK: &str = "merged_app.apk";
const UNSIGNED_APK: &str = "out.apk";
const SIGNED_APKS: &[&str] = &[
    "out-aligned-signed.apk",
    "out-signed.apk",
    "out-debugSigned.apk",
    "out-aligned-debugSigned.apk",
];
const JAVA_OPTIONS_VAR: &str = "_JAVA_OPTIONS";
const STEPS: u64 = 10;

/// One invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    async fn execute(&self, command: &ToolCommand) -> Result<CommandOutput>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn execute(&self, command: &ToolCommand) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&command.cwd)
            .output()
            .await
            .with_context(|| format!("Failed to start {}", command.program.display()))?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// What a finished run produced.
#[derive(Debug)]
pub struct PipelineReport {
    pub output: PathBuf,
    pub size_bytes: u64,
    pub signed: bool,
    pub elapsed: Duration,
    pub outcome: PatchOutcome,
}

pub struct Pipeline<R: CommandRunner> {
    config: ResolvedConfig,
    work_dir: PathBuf,
    java: Option<PathBuf>,
    runner: R,
    progress: ProgressBar,
}

impl<R: CommandRunner> Pipeline<R> {
    pub fn new(config: ResolvedConfig, work_dir: PathBuf, runner: R) -> Self {
        Self {
            config,
            work_dir,
            java: None,
            runner,
            progress: ProgressBar::hidden(),
        }
    }

    /// Uses `java` instead of looking it up on `PATH`.
    pub fn with_java(mut self, java: PathBuf) -> Self {
        self.java = Some(java);
        self
    }

    pub fn with_progress(mut self) -> Result<Self> {
        let progress = ProgressBar::new(STEPS);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        self.progress = progress;
        Ok(self)
    }

    pub async fn run(&self, bundle: &Path) -> Result<PipelineReport> {
        let started = Instant::now();

        self.step(1, "Checking requirements");
        let java = self.preflight(bundle)?;

        let (output, signed, outcome) = match self.produce(&java, bundle).await {
            Ok(produced) => produced,
            Err(e) => {
                self.progress.abandon_with_message("Failed");
                if let Err(cleanup_error) = self.cleanup().await {
                    warn!("Cleanup after the failed run did not finish: {cleanup_error:#}");
                }
                return Err(e);
            }
        };

        self.step(10, "Cleaning up");
        self.cleanup().await?;
        self.progress.finish_with_message("Done");

        let size_bytes = fs::metadata(&output).await?.len();
        Ok(PipelineReport {
            output,
            size_bytes,
            signed,
            elapsed: started.elapsed(),
            outcome,
        })
    }

    /// Steps 2 to 9. Returns the published APK, whether it is signed and
    /// the engine's outcome.
    async fn produce(&self, java: &Path, bundle: &Path) -> Result<(PathBuf, bool, PatchOutcome)> {
        self.step(2, "Extracting base.apk");
        let base_apk = self.extract_base_apk(bundle).await?;

        self.step(3, "Preparing supplemental libraries");
        self.synthesize_firebase_library(&base_apk).await?;

        self.step(4, "Removing stale outputs");
        let merged = self.work_dir.join(MERGED_APK);
        let decompiled = self.work_dir.join(&self.config.decompile_dir);
        remove_if_exists(&merged).await?;
        remove_if_exists(&decompiled).await?;

        self.step(5, "Merging split APKs");
        let bundle_arg = bundle.display().to_string();
        self.run_apk_editor(
            java,
            &["m", "-i", bundle_arg.as_str(), "-o", MERGED_APK, "-extractNativeLibs", "true"],
            "Merge",
        )
        .await?;

        self.step(6, "Decompiling merged APK");
        self.run_apk_editor(
            java,
            &["d", "-i", MERGED_APK, "-o", self.config.decompile_dir.as_str()],
            "Decompile",
        )
        .await?;

        self.step(7, "Patching decompiled files");
        let outcome = self.patch_tree(decompiled, merged).await?;

        self.step(8, "Building modified APK");
        let unsigned = self.work_dir.join(UNSIGNED_APK);
        remove_if_exists(&unsigned).await?;
        self.run_apk_editor(
            java,
            &["b", "-i", self.config.decompile_dir.as_str(), "-o", UNSIGNED_APK],
            "Build",
        )
        .await?;
        if !unsigned.is_file() {
            anyhow::bail!("Build did not produce {}", unsigned.display());
        }

        self.step(9, "Signing APK");
        let signer = self.work_dir.join(&self.config.signer_jar);
        self.run_tool(
            java,
            vec![
                "-jar".to_string(),
                signer.display().to_string(),
                "-a".to_string(),
                UNSIGNED_APK.to_string(),
                "--overwrite".to_string(),
            ],
            "Sign",
        )
        .await?;
        let (output, signed) = self.publish(bundle).await?;
        Ok((output, signed, outcome))
    }

    fn step(&self, index: u64, message: &'static str) {
        self.progress.set_position(index - 1);
        self.progress.set_message(message);
        info!("→ Step {index}/{STEPS}: {message}");
    }

    fn preflight(&self, bundle: &Path) -> Result<PathBuf> {
        if !bundle.is_file() {
            anyhow::bail!("Input file not found: {}", bundle.display());
        }
        if bundle.extension().map_or(true, |ext| ext != "apks") {
            warn!("{} does not have an .apks extension", bundle.display());
        }

        for jar in [&self.config.apk_editor_jar, &self.config.signer_jar] {
            let path = self.work_dir.join(jar);
            if !path.is_file() {
                anyhow::bail!("Required tool not found: {}", path.display());
            }
        }

        let java = match &self.java {
            Some(java) => java.clone(),
            None => which::which("java").context("Java not found on PATH")?,
        };
        info!("✓ Using Java at {}", java.display());
        Ok(java)
    }

    async fn extract_base_apk(&self, bundle: &Path) -> Result<PathBuf> {
        let bundle = bundle.to_path_buf();
        let destination = self.work_dir.join(BASE_APK);

        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let file = std::fs::File::open(&bundle)?;
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("{} is not a valid bundle", bundle.display()))?;
            let mut entry = zip
                .by_name(BASE_APK)
                .with_context(|| format!("{BASE_APK} not found in {}", bundle.display()))?;
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            Ok(data)
        })
        .await??;

        fs::write(&destination, data).await?;
        info!("✓ Extracted {}", destination.display());
        Ok(destination)
    }

    /// Copies the extracted base.apk over the Firebase library, replacing
    /// whatever an earlier run left there.
    async fn synthesize_firebase_library(&self, base_apk: &Path) -> Result<()> {
        if !self.config.synthesize_firebase_library {
            info!(
                "→ Expecting {} to be provided",
                self.config.firebase_library
            );
            return Ok(());
        }

        let library = self.work_dir.join(&self.config.firebase_library);
        fs::copy(base_apk, &library)
            .await
            .with_context(|| format!("Failed to create {}", library.display()))?;
        info!("✓ Created {} from {BASE_APK}", self.config.firebase_library);
        Ok(())
    }

    async fn patch_tree(&self, tree: PathBuf, archive: PathBuf) -> Result<PatchOutcome> {
        let config = self.config.clone();
        let source_dir = self.work_dir.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let settings = LibrarySettings::from_config(&config, source_dir, Some(archive));
            Patcher::new(&config, settings, &LogReporter).patch(&tree)
        })
        .await
        .context("Patch worker stopped unexpectedly")??;

        Ok(outcome)
    }

    fn java_env(&self) -> Vec<(String, String)> {
        if std::env::var_os(JAVA_OPTIONS_VAR).is_some() {
            Vec::new()
        } else {
            vec![(JAVA_OPTIONS_VAR.to_string(), self.config.java_options.clone())]
        }
    }

    async fn run_apk_editor(&self, java: &Path, args: &[&str], what: &str) -> Result<()> {
        let jar = self.work_dir.join(&self.config.apk_editor_jar);
        let mut full_args = vec!["-jar".to_string(), jar.display().to_string()];
        full_args.extend(args.iter().map(|arg| arg.to_string()));
        self.run_tool(java, full_args, what).await
    }

    async fn run_tool(&self, java: &Path, args: Vec<String>, what: &str) -> Result<()> {
        let command = ToolCommand {
            program: java.to_path_buf(),
            args,
            env: self.java_env(),
            cwd: self.work_dir.clone(),
        };

        let output = self.runner.execute(&command).await?;
        debug!("{what} output:\n{}", output.stdout);
        if !output.success() {
            anyhow::bail!(
                "{what} failed (exit code {}): {}",
                output
                    .exit_code
                    .map_or_else(|| "none".to_string(), |code| code.to_string()),
                output.stderr.trim()
            );
        }
        info!("✓ {what} completed");
        Ok(())
    }

    /// Copies the signed APK, or the unsigned one when signing produced
    /// nothing, to `<bundle stem>-patched.apk`.
    async fn publish(&self, bundle: &Path) -> Result<(PathBuf, bool)> {
        let stem = bundle
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("app");
        let output = self.work_dir.join(format!("{stem}-patched.apk"));

        let (source, signed) = match locate_signed_apk(&self.work_dir) {
            Some(signed) => (signed, true),
            None => {
                warn!("Signing produced no APK, using the unsigned build");
                (self.work_dir.join(UNSIGNED_APK), false)
            }
        };
        fs::copy(&source, &output)
            .await
            .with_context(|| format!("Failed to copy {} to {}", source.display(), output.display()))?;
        info!("✓ Wrote {}", output.display());
        Ok((output, signed))
    }

    /// Runs after every started run, failed or not. A synthesized Firebase
    /// library never outlives its run.
    async fn cleanup(&self) -> Result<()> {
        let removed = remove_tool_leftovers(&self.work_dir).await?;
        info!("✓ Removed {removed} temporary files/directories");

        if self.config.synthesize_firebase_library {
            remove_if_exists(&self.work_dir.join(&self.config.firebase_library)).await?;
        }
        if self.config.keep_intermediates {
            return Ok(());
        }
        let mut intermediates: Vec<PathBuf> = [BASE_APK, MERGED_APK, UNSIGNED_APK]
            .iter()
            .chain(SIGNED_APKS)
            .map(|name| self.work_dir.join(name))
            .collect();
        intermediates.push(self.work_dir.join(&self.config.decompile_dir));

        for path in intermediates {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }
}

pub fn locate_signed_apk(dir: &Path) -> Option<PathBuf> {
    SIGNED_APKS
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Removes `*.tmp*` files and `tmp-*` directories the Java tools leave in
/// `dir`. Returns how many were removed.
pub async fn remove_tool_leftovers(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let file_type = entry.file_type().await?;
        let result = if file_type.is_file() && name.contains(".tmp") {
            fs::remove_file(entry.path()).await
        } else if file_type.is_dir() && name.starts_with("tmp-") {
            fs::remove_dir_all(entry.path()).await
        } else {
            continue;
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {e}", entry.path().display()),
        }
    }
    Ok(removed)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
