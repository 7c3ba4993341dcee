use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

macro_rules! merge_fields {
    ($self:expr, $other:expr, $($field:ident),*) => {
        $(
            if let Some(ref $field) = $other.$field {
                $self.$field = $field.clone();
            }
        )*
    };
}

pub const CONFIG_FILE_NAMES: &[&str] = &["pairip.json", "pairip.config.json"];

/// The configuration file as written by the user; every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatcherConfig {
    #[serde(rename = "apkEditorJar")]
    pub apk_editor_jar: Option<String>,
    #[serde(rename = "signerJar")]
    pub signer_jar: Option<String>,
    #[serde(rename = "javaOptions")]
    pub java_options: Option<String>,
    #[serde(rename = "decompileDir")]
    pub decompile_dir: Option<String>,
    #[serde(rename = "libDir")]
    pub lib_dir: Option<String>,
    #[serde(rename = "protectionLibrary")]
    pub protection_library: Option<String>,
    #[serde(rename = "supplementalLibraries")]
    pub supplemental_libraries: Option<Vec<String>>,
    #[serde(rename = "supportedAbis")]
    pub supported_abis: Option<Vec<String>>,
    #[serde(rename = "synthesizeFirebaseLibrary")]
    pub synthesize_firebase_library: Option<bool>,
    #[serde(rename = "firebaseLibrary")]
    pub firebase_library: Option<String>,
    #[serde(rename = "resourceFiles")]
    pub resource_files: Option<Vec<String>>,
    #[serde(rename = "keepIntermediates")]
    pub keep_intermediates: Option<bool>,
}

impl PatcherConfig {
    pub fn template() -> Self {
        let defaults = ResolvedConfig::default();
        Self {
            apk_editor_jar: Some(defaults.apk_editor_jar),
            signer_jar: Some(defaults.signer_jar),
            java_options: Some(defaults.java_options),
            decompile_dir: Some(defaults.decompile_dir),
            lib_dir: Some(defaults.lib_dir),
            protection_library: Some(defaults.protection_library),
            supplemental_libraries: Some(defaults.supplemental_libraries),
            supported_abis: Some(
                defaults
                    .supported_abis
                    .iter()
                    .map(|arch| arch.android_abi().to_string())
                    .collect(),
            ),
            synthesize_firebase_library: Some(defaults.synthesize_firebase_library),
            firebase_library: Some(defaults.firebase_library),
            resource_files: Some(defaults.resource_files),
            keep_intermediates: Some(defaults.keep_intermediates),
        }
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut resolved = ResolvedConfig::default();
        resolved.merge_from(self)?;
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    Arm32,
    Arm64,
    X86,
    X86_64,
}

impl Arch {
    pub fn from_abi(abi: &str) -> Result<Self> {
        match abi {
            "armeabi-v7a" => Ok(Arch::Arm32),
            "arm64-v8a" => Ok(Arch::Arm64),
            "x86" => Ok(Arch::X86),
            "x86_64" => Ok(Arch::X86_64),
            _ => anyhow::bail!("Unsupported ABI: {abi}"),
        }
    }

    pub fn android_abi(&self) -> &'static str {
        match self {
            Arch::Arm32 => "armeabi-v7a",
            Arch::Arm64 => "arm64-v8a",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.android_abi())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub apk_editor_jar: String,
    pub signer_jar: String,
    pub java_options: String,
    pub decompile_dir: String,
    /// Native library directory, relative to the decompiled tree.
    pub lib_dir: String,
    pub protection_library: String,
    pub supplemental_libraries: Vec<String>,
    pub supported_abis: Vec<Arch>,
    pub synthesize_firebase_library: bool,
    pub firebase_library: String,
    pub resource_files: Vec<String>,
    pub keep_intermediates: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            apk_editor_jar: "APKEditor-1.4.3.jar".to_string(),
            signer_jar: "uber-apk-signer.jar".to_string(),
            java_options: "-Xmx2g".to_string(),
            decompile_dir: "merged_app_decompile_xml".to_string(),
            lib_dir: "root/lib".to_string(),
            protection_library: "libpairipcore.so".to_string(),
            supplemental_libraries: vec![
                "libpairipcorex.so".to_string(),
                "libFirebaseCppApp.so".to_string(),
            ],
            supported_abis: vec![Arch::Arm64, Arch::Arm32, Arch::X86, Arch::X86_64],
            synthesize_firebase_library: true,
            firebase_library: "libFirebaseCppApp.so".to_string(),
            resource_files: vec!["file_paths.xml".to_string()],
            keep_intermediates: false,
        }
    }
}

impl ResolvedConfig {
    pub fn merge_from(&mut self, other: &PatcherConfig) -> Result<()> {
        merge_fields!(
            self,
            other,
            apk_editor_jar,
            signer_jar,
            java_options,
            decompile_dir,
            lib_dir,
            protection_library,
            supplemental_libraries,
            synthesize_firebase_library,
            firebase_library,
            resource_files,
            keep_intermediates
        );

        if let Some(abis) = &other.supported_abis {
            self.supported_abis = abis
                .iter()
                .map(|abi| Arch::from_abi(abi))
                .collect::<Result<_>>()?;
        }
        Ok(())
    }
}

/// Looks for a config file in `start_dir` and each of its parents.
pub fn find_config_file(start_dir: PathBuf) -> Option<PathBuf> {
    let mut current_dir = start_dir;

    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = current_dir.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        match current_dir.parent() {
            Some(parent) => current_dir = parent.to_path_buf(),
            None => return None,
        }
    }
}

pub fn load_config(path: &PathBuf) -> Result<ResolvedConfig> {
    let config_content = std::fs::read_to_string(path)?;
    let config: PatcherConfig = json5::from_str(&config_content)?;
    config.resolve()
}
