// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zip archive handling for bundles and dossiers.
//!
//! Signing operates on directory trees. Archives (`.ipa` files, zipped
//! dossiers and combined dossier+bundle archives) are expanded into a
//! scratch directory before use and re-created afterwards.

use {
    crate::error::DossierError,
    log::{debug, info},
    std::{
        fs::File,
        io::{BufReader, Read, Write},
        path::{Component, Path, PathBuf},
    },
    walkdir::WalkDir,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Top-level directories permitted in an application archive.
pub const ALLOWED_ARCHIVE_TOP_LEVEL: &[&str] = &[
    "Payload",
    "SwiftSupport",
    "WatchKitSupport",
    "WatchKitSupport2",
    "MessagesApplicationSupport",
    "MessagesApplicationExtensionSupport",
    "Symbols",
];

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Extract a zip archive into `dest_dir`.
///
/// POSIX permissions recorded in the archive are restored, so executables
/// remain executable. Entries whose names would resolve outside of
/// `dest_dir` are rejected, as are symlinks pointing outside of `dest_dir`
/// and entries that would be written through a previously extracted
/// symlink.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), DossierError> {
    info!(
        "extracting {} to {}",
        archive_path.display(),
        dest_dir.display()
    );

    let fh = File::open(archive_path)?;
    let mut za = zip::ZipArchive::new(BufReader::new(fh))?;

    std::fs::create_dir_all(dest_dir)?;

    for i in 0..za.len() {
        let mut zf = za.by_index(i)?;

        let relative = match zf.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => return Err(DossierError::ArchiveEntryUnsafe(zf.name().to_string())),
        };
        let dest_path = dest_dir.join(&relative);
        let mode = zf.unix_mode();

        if passes_through_symlink(dest_dir, &relative) {
            return Err(DossierError::ArchiveEntryUnsafe(zf.name().to_string()));
        }

        if zf.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            continue;
        }

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if mode.map(is_symlink_mode).unwrap_or(false) {
            let mut target = String::new();
            zf.read_to_string(&mut target)?;

            if !symlink_target_is_enclosed(&relative, &target) {
                return Err(DossierError::ArchiveEntryUnsafe(format!(
                    "{} -> {}",
                    zf.name(),
                    target
                )));
            }

            create_symlink(&target, &dest_path)?;
            continue;
        }

        {
            let mut fh = File::create(&dest_path)?;
            std::io::copy(&mut zf, &mut fh)?;
        }

        #[cfg(unix)]
        if let Some(mode) = mode {
            std::fs::set_permissions(
                &dest_path,
                std::fs::Permissions::from_mode(mode & 0o7777),
            )?;
        }
    }

    Ok(())
}

/// Whether a symlink at `link` (relative to the extraction root) pointing at
/// `target` stays within the extraction root.
fn symlink_target_is_enclosed(link: &Path, target: &str) -> bool {
    let mut depth = link
        .parent()
        .map(|p| p.components().count())
        .unwrap_or(0);

    for component in Path::new(target).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }

    true
}

/// Whether any existing ancestor of `relative` under `root` is a symlink.
fn passes_through_symlink(root: &Path, relative: &Path) -> bool {
    let mut current = root.to_path_buf();

    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            current.push(component);

            match current.symlink_metadata() {
                Ok(metadata) if metadata.file_type().is_symlink() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    }

    false
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<(), DossierError> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(target: &str, link: &Path) -> Result<(), DossierError> {
    let mut fh = File::create(link)?;
    fh.write_all(target.as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

fn zip_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write the content of `source_dir` to a new zip archive at `dest_path`.
///
/// Archive entries are relative to `source_dir` and written in sorted order.
/// If `prefix` is given, every entry is placed under that directory name.
pub fn zip_directory(
    source_dir: &Path,
    dest_path: &Path,
    prefix: Option<&str>,
) -> Result<(), DossierError> {
    info!(
        "creating archive {} from {}",
        dest_path.display(),
        source_dir.display()
    );

    if let Some(parent) = dest_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut zf = zip::ZipWriter::new(File::create(dest_path)?);

    for entry in WalkDir::new(source_dir)
        .min_depth(1)
        .sort_by_file_name()
        .follow_links(false)
    {
        let entry = entry.map_err(|e| DossierError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|_| {
                DossierError::MalformedBundleTree(
                    entry.path().to_path_buf(),
                    "path escaped its source directory while walking".into(),
                )
            })?;

        let name = match prefix {
            Some(prefix) => format!("{}/{}", prefix, zip_name(relative)),
            None => zip_name(relative),
        };

        let metadata = entry.path().symlink_metadata()?;
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(file_mode(&metadata));

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            debug!("adding symlink {} -> {}", name, target.display());
            zf.add_symlink(name, target.to_string_lossy(), options)?;
        } else if metadata.is_dir() {
            zf.add_directory(name, options)?;
        } else {
            zf.start_file(name, options)?;
            let mut fh = File::open(entry.path())?;
            std::io::copy(&mut fh, &mut zf)?;
        }
    }

    let mut fh = zf.finish()?;
    fh.flush()?;

    Ok(())
}

/// Locate the single application bundle under `<root>/Payload/`.
pub fn find_payload_bundle(root: &Path) -> Result<PathBuf, DossierError> {
    let payload = root.join("Payload");

    if !payload.is_dir() {
        return Err(DossierError::MalformedBundleTree(
            root.to_path_buf(),
            "no Payload directory".into(),
        ));
    }

    let mut apps = vec![];
    for entry in std::fs::read_dir(&payload)? {
        let path = entry?.path();
        if path.is_dir() && path.extension().map(|e| e == "app").unwrap_or(false) {
            apps.push(path);
        }
    }

    match apps.len() {
        1 => Ok(apps.remove(0)),
        0 => Err(DossierError::MalformedBundleTree(
            payload,
            "no .app bundle found".into(),
        )),
        _ => Err(DossierError::MalformedBundleTree(
            payload,
            "multiple .app bundles found".into(),
        )),
    }
}

/// Extract an application archive and return the path to its bundle.
///
/// The archive is expected to follow the `.ipa` layout, with the bundle
/// at `Payload/<name>.app`.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf, DossierError> {
    extract_zip(archive_path, dest_dir)?;
    find_payload_bundle(dest_dir)
}

/// Verify `tree_root` only contains recognized top-level archive directories.
pub fn validate_archive_tree(tree_root: &Path) -> Result<(), DossierError> {
    let mut saw_payload = false;

    for entry in std::fs::read_dir(tree_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        if !ALLOWED_ARCHIVE_TOP_LEVEL.contains(&name.as_str()) {
            return Err(DossierError::MalformedBundleTree(
                tree_root.to_path_buf(),
                format!("unexpected top-level entry {}", name),
            ));
        }

        if name == "Payload" {
            saw_payload = true;
        }
    }

    if !saw_payload {
        return Err(DossierError::MalformedBundleTree(
            tree_root.to_path_buf(),
            "no Payload directory".into(),
        ));
    }

    Ok(())
}

/// Create an application archive at `dest_path` from an expanded tree.
pub fn package_archive(tree_root: &Path, dest_path: &Path) -> Result<PathBuf, DossierError> {
    validate_archive_tree(tree_root)?;
    zip_directory(tree_root, dest_path, None)?;

    Ok(dest_path.to_path_buf())
}

/// Recursively copy a directory tree, preserving symlinks and permissions.
pub fn copy_directory(source_dir: &Path, dest_dir: &Path) -> Result<(), DossierError> {
    std::fs::create_dir_all(dest_dir)?;

    for entry in WalkDir::new(source_dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| DossierError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|_| {
                DossierError::MalformedBundleTree(
                    entry.path().to_path_buf(),
                    "path escaped its source directory while walking".into(),
                )
            })?;
        let dest_path = dest_dir.join(relative);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            create_symlink(&target.to_string_lossy(), &dest_path)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else {
            // std::fs::copy() carries permission bits over.
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::error::ErrorKind};

    fn write_file(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn archive_round_trip_preserves_executable_bit() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let tree = td.path().join("tree");
        let app = tree.join("Payload").join("Fake.app");

        write_file(&app.join("Info.plist"), b"plist");
        write_file(&app.join("Fake"), b"\xcf\xfa\xed\xfe");
        #[cfg(unix)]
        std::fs::set_permissions(app.join("Fake"), std::fs::Permissions::from_mode(0o755))?;

        let archive = td.path().join("Fake.ipa");
        package_archive(&tree, &archive)?;

        let dest = td.path().join("extracted");
        let bundle = extract_archive(&archive, &dest)?;
        assert_eq!(bundle, dest.join("Payload").join("Fake.app"));
        assert_eq!(std::fs::read(bundle.join("Info.plist"))?, b"plist");

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(bundle.join("Fake"))?.permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
            let mode = std::fs::metadata(bundle.join("Info.plist"))?
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0);
        }

        Ok(())
    }

    #[test]
    fn package_rejects_unknown_top_level() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let tree = td.path().join("tree");
        write_file(&tree.join("Payload").join("Fake.app").join("Info.plist"), b"");
        write_file(&tree.join("junk").join("file"), b"");

        let err = package_archive(&tree, &td.path().join("out.ipa")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(!td.path().join("out.ipa").exists());

        Ok(())
    }

    #[test]
    fn package_requires_payload() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let tree = td.path().join("tree");
        write_file(&tree.join("Symbols").join("x"), b"");

        assert!(matches!(
            package_archive(&tree, &td.path().join("out.ipa")),
            Err(DossierError::MalformedBundleTree(..))
        ));

        Ok(())
    }

    #[test]
    fn find_payload_bundle_requires_single_app() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        std::fs::create_dir_all(td.path().join("Payload").join("A.app"))?;
        assert!(find_payload_bundle(td.path()).is_ok());

        std::fs::create_dir_all(td.path().join("Payload").join("B.app"))?;
        assert!(find_payload_bundle(td.path()).is_err());

        Ok(())
    }

    #[test]
    fn zip_directory_with_prefix() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let source = td.path().join("source");
        write_file(&source.join("a").join("b.txt"), b"hello");

        let archive = td.path().join("out.zip");
        zip_directory(&source, &archive, Some("dossier"))?;

        let dest = td.path().join("dest");
        extract_zip(&archive, &dest)?;
        assert_eq!(
            std::fs::read(dest.join("dossier").join("a").join("b.txt"))?,
            b"hello"
        );

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn copy_directory_preserves_symlinks() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let source = td.path().join("Foo.framework");
        write_file(&source.join("Versions").join("A").join("Foo"), b"bin");
        std::os::unix::fs::symlink("A", source.join("Versions").join("Current"))?;

        let dest = td.path().join("copy");
        copy_directory(&source, &dest)?;

        let link = dest.join("Versions").join("Current");
        assert!(link.symlink_metadata()?.file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link)?, PathBuf::from("A"));
        assert_eq!(std::fs::read(link.join("Foo"))?, b"bin");

        Ok(())
    }

    fn write_zip(path: &Path, build: impl FnOnce(&mut zip::ZipWriter<File>)) {
        let mut zf = zip::ZipWriter::new(File::create(path).unwrap());
        build(&mut zf);
        zf.finish().unwrap();
    }

    #[test]
    fn extract_rejects_parent_traversal() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let archive = td.path().join("evil.zip");
        write_zip(&archive, |zf| {
            zf.start_file("../escaped.txt", zip::write::FileOptions::default())
                .unwrap();
            zf.write_all(b"nope").unwrap();
        });

        let dest = td.path().join("dest");
        let err = extract_zip(&archive, &dest).unwrap_err();
        assert!(matches!(err, DossierError::ArchiveEntryUnsafe(_)));
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(!td.path().join("escaped.txt").exists());

        Ok(())
    }

    #[test]
    fn extract_rejects_escaping_symlinks() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let outside = td.path().join("outside");
        std::fs::create_dir_all(&outside)?;

        for target in [
            outside.to_string_lossy().to_string(),
            "../outside".to_string(),
            "a/../../../outside".to_string(),
        ] {
            let archive = td.path().join("evil.zip");
            write_zip(&archive, |zf| {
                zf.add_symlink("dir/link", target.as_str(), zip::write::FileOptions::default())
                    .unwrap();
                zf.start_file("dir/link/pwned", zip::write::FileOptions::default())
                    .unwrap();
                zf.write_all(b"nope").unwrap();
            });

            let dest = td.path().join("dest");
            let err = extract_zip(&archive, &dest).unwrap_err();
            assert!(matches!(err, DossierError::ArchiveEntryUnsafe(_)));
            assert!(!outside.join("pwned").exists());

            std::fs::remove_dir_all(&dest)?;
        }

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn extract_rejects_writes_through_symlinks() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let archive = td.path().join("evil.zip");
        write_zip(&archive, |zf| {
            zf.add_symlink("Versions/Current", "A", zip::write::FileOptions::default())
                .unwrap();
            zf.start_file("Versions/Current/Foo", zip::write::FileOptions::default())
                .unwrap();
            zf.write_all(b"bin").unwrap();
        });

        let dest = td.path().join("dest");
        let err = extract_zip(&archive, &dest).unwrap_err();
        assert!(matches!(err, DossierError::ArchiveEntryUnsafe(_)));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn extract_keeps_enclosed_symlinks() -> Result<(), DossierError> {
        let td = tempfile::TempDir::new()?;
        let source = td.path().join("Foo.framework");
        write_file(&source.join("Versions").join("A").join("Foo"), b"bin");
        std::os::unix::fs::symlink("A", source.join("Versions").join("Current"))?;
        std::os::unix::fs::symlink("Versions/Current/Foo", source.join("Foo"))?;

        let archive = td.path().join("framework.zip");
        zip_directory(&source, &archive, None)?;

        let dest = td.path().join("dest");
        extract_zip(&archive, &dest)?;

        assert_eq!(
            std::fs::read_link(dest.join("Versions").join("Current"))?,
            PathBuf::from("A")
        );
        assert_eq!(std::fs::read(dest.join("Foo"))?, b"bin");

        Ok(())
    }
}
