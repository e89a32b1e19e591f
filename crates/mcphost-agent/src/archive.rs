use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
        }
    }
}

fn normalize_entry_path(rel: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        anyhow::bail!("absolute path in archive: {rel:?}");
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => anyhow::bail!("path traversal in archive: {rel:?}"),
            Component::Prefix(_) | Component::RootDir => {
                anyhow::bail!("absolute path in archive: {rel:?}")
            }
        }
    }
    Ok(out)
}

fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> anyhow::Result<usize> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(f).context("read zip directory")?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_entry_path(trimmed)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            // Keep exec bits for launch scripts; never restore setuid/setgid/sticky.
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
        }
        files += 1;
    }
    Ok(files)
}

fn extract_tar_safely<R: Read>(reader: R, out_dir: &Path) -> anyhow::Result<usize> {
    fs::create_dir_all(out_dir)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);

    let mut files = 0;
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().to_string();
        normalize_entry_path(raw.trim_end_matches('/'))?;

        if entry.header().entry_type().is_file() {
            files += 1;
        }
        if !entry
            .unpack_in(out_dir)
            .with_context(|| format!("unpack {raw:?}"))?
        {
            anyhow::bail!("tar entry escapes extraction dir: {raw:?}");
        }
    }
    Ok(files)
}

pub fn extract(archive_path: &Path, kind: ArchiveKind, out_dir: &Path) -> anyhow::Result<usize> {
    match kind {
        ArchiveKind::Zip => extract_zip_safely(archive_path, out_dir),
        ArchiveKind::Tar => {
            let f = fs::File::open(archive_path)
                .with_context(|| format!("open {}", archive_path.display()))?;
            extract_tar_safely(f, out_dir)
        }
        ArchiveKind::TarGz => {
            let f = fs::File::open(archive_path)
                .with_context(|| format!("open {}", archive_path.display()))?;
            extract_tar_safely(flate2::read::GzDecoder::new(f), out_dir)
        }
    }
}

// Extract on the blocking pool, then delete the staged archive whatever the outcome.
pub async fn extract_and_remove(
    archive_path: PathBuf,
    kind: ArchiveKind,
    out_dir: PathBuf,
) -> anyhow::Result<usize> {
    let staged = archive_path.clone();
    let res = tokio::task::spawn_blocking(move || extract(&archive_path, kind, &out_dir))
        .await
        .context("join extraction task")?;

    if let Err(e) = tokio::fs::remove_file(&staged).await {
        tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged archive");
    }
    res
}
