use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use cargo_metadata::{DependencyKind, Metadata, MetadataCommand};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::data::source::with_path;
use crate::error::{PypeError, Result};

pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const DIGEST_FILE: &str = "artifacts.sha256";

/// The requirement line for this framework build.
pub fn framework_requirement() -> String {
    format!("{}=={}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Pinned `name==version` lines for the root package and its normal
/// dependencies, resolved through `cargo metadata`.
pub fn generate_requirements(manifest_path: Option<&Path>) -> Result<Vec<String>> {
    let mut command = MetadataCommand::new();
    if let Some(path) = manifest_path {
        command.manifest_path(path);
    }
    let metadata = command
        .exec()
        .map_err(|err| PypeError::config(format!("Failed to fetch cargo metadata: {err}")))?;
    Ok(requirements_from_metadata(&metadata))
}

fn requirements_from_metadata(metadata: &Metadata) -> Vec<String> {
    let Some(root) = metadata.root_package() else {
        return vec![framework_requirement()];
    };
    let mut lines = vec![format!("{}=={}", root.name, root.version)];
    let mut pinned: Vec<String> = root
        .dependencies
        .iter()
        .filter(|dep| dep.kind == DependencyKind::Normal)
        .filter_map(|dep| {
            metadata
                .packages
                .iter()
                .filter(|pkg| pkg.name == dep.name && dep.req.matches(&pkg.version))
                .max_by(|a, b| a.version.cmp(&b.version))
                .map(|pkg| format!("{}=={}", pkg.name, pkg.version))
        })
        .collect();
    pinned.sort();
    pinned.dedup();
    lines.extend(pinned);
    lines
}

pub fn write_requirements(lines: &[String], output: &Path) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(output, content).map_err(|err| with_path(err, output))
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|err| with_path(err, path))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes `digest  relative/path` lines for every file below `folder`
/// except the digest file itself.
pub fn write_digests(folder: &Path) -> Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    for path in artifact_files(folder)? {
        let relative = relative_name(folder, &path);
        if relative == DIGEST_FILE {
            continue;
        }
        digests.insert(relative, compute_sha256(&path)?);
    }
    let output = folder.join(DIGEST_FILE);
    let mut file = File::create(&output).map_err(|err| with_path(err, &output))?;
    for (name, digest) in &digests {
        writeln!(file, "{digest}  {name}").map_err(|err| with_path(err, &output))?;
    }
    debug!(files = digests.len(), "Artifact digests written");
    Ok(digests)
}

/// Files whose digest no longer matches, or that disappeared.
pub fn verify_digests(folder: &Path) -> Result<Vec<String>> {
    let listing = folder.join(DIGEST_FILE);
    let content = fs::read_to_string(&listing).map_err(|err| with_path(err, &listing))?;
    let mut mismatched = Vec::new();
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let (expected, name) = line.split_once("  ").ok_or_else(|| {
            PypeError::config(format!("malformed digest line in {}: {line}", listing.display()))
        })?;
        let path = folder.join(name);
        match compute_sha256(&path) {
            Ok(actual) if actual == expected => {}
            _ => mismatched.push(name.to_string()),
        }
    }
    Ok(mismatched)
}

fn artifact_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![folder.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).map_err(|err| with_path(err, &dir))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn relative_name(folder: &Path, path: &Path) -> String {
    path.strip_prefix(folder)
        .unwrap_or(path)
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
