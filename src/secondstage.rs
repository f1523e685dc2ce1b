// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! In-image provisioning.

The second stage runs inside each platform's build, against the image
filesystem: `merge-usr` first, then `provision`, which configures dpkg,
applies recipe users/groups/files/content/commands, and optionally slims
the tree. All operations take the filesystem root as a parameter so they
can be exercised against scratch roots.
*/

use {
    crate::{
        error::{BuildError, Result},
        recipe::{parse_mode, ContentSpec, FileSpec, GroupSpec, Recipe, UserSpec},
        slim::SlimPatterns,
    },
    std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        process::Command,
    },
    tracing::{debug, info, warn},
};

/// Top-level directories folded into `/usr` by the merge.
const MERGED_DIRS: &[&str] = &["bin", "sbin", "lib", "lib32", "lib64", "libx32"];

/// First uid/gid allocated when the recipe does not pin one.
const FIRST_DYNAMIC_ID: u32 = 1000;

/// Merge top-level `/bin`, `/sbin`, `/lib*` into `/usr` and leave
/// symlinks behind.
///
/// Colliding regular files with identical content collapse; differing
/// content is fatal.
pub fn merge_usr(root: &Path) -> Result<()> {
    for name in MERGED_DIRS {
        let top = root.join(name);

        let metadata = match std::fs::symlink_metadata(&top) {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };

        if metadata.file_type().is_symlink() {
            continue;
        }

        let target = root.join("usr").join(name);
        std::fs::create_dir_all(&target)?;

        move_tree(&top, &target)?;

        std::fs::remove_dir_all(&top)?;
        std::os::unix::fs::symlink(format!("usr/{}", name), &top)?;

        info!(directory = *name, "merged into /usr");
    }

    Ok(())
}

/// Move the contents of `src` into `dest`, merging directories and
/// collapsing identical files.
fn move_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());

        let from_meta = std::fs::symlink_metadata(&from)?;

        match std::fs::symlink_metadata(&to) {
            Err(_) => {
                std::fs::rename(&from, &to)?;
            }
            Ok(to_meta) if from_meta.is_dir() && to_meta.is_dir() => {
                move_tree(&from, &to)?;
            }
            Ok(to_meta) if from_meta.is_file() && to_meta.is_file() => {
                if std::fs::read(&from)? != std::fs::read(&to)? {
                    return Err(BuildError::UsrMergeCollision(to.display().to_string()));
                }
                std::fs::remove_file(&from)?;
            }
            Ok(_) => {
                return Err(BuildError::UsrMergeCollision(to.display().to_string()));
            }
        }
    }

    Ok(())
}

/// Provision the image per the recipe.
pub fn provision(root: &Path, recipe: &Recipe) -> Result<()> {
    configure_packages(root)?;

    for group in &recipe.groups {
        apply_group(root, group)?;
    }

    for user in &recipe.users {
        apply_user(root, user)?;
    }

    for file in &recipe.files {
        apply_file(root, file)?;
    }

    for content in &recipe.content {
        apply_content(root, content)?;
    }

    for command in &recipe.commands {
        run_command(root, command)?;
    }

    if recipe.options.slim {
        slim_tree(root, &SlimPatterns::default_set())?;
    }

    Ok(())
}

/// Run `dpkg --configure`, honoring the configure order computed at
/// unpack time, then sweep the remainder.
fn configure_packages(root: &Path) -> Result<()> {
    let order_path = root.join("tmp/configure-order");

    let dpkg = |args: &[&str]| -> Result<()> {
        let status = Command::new("dpkg")
            .arg(format!("--root={}", root.display()))
            .arg("--force-unsafe-io")
            .args(args)
            .status()
            .map_err(|e| BuildError::SecondStageFailure(format!("dpkg: {}", e)))?;

        if !status.success() {
            return Err(BuildError::SecondStageFailure(format!(
                "dpkg {} exited with {}",
                args.join(" "),
                status
            )));
        }

        Ok(())
    };

    if let Ok(order) = std::fs::read_to_string(&order_path) {
        for name in order.lines().filter(|l| !l.is_empty()) {
            debug!(package = name, "configuring");
            dpkg(&["--configure", name])?;
        }
    }

    dpkg(&["--configure", "-a"])
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, lines.join("\n") + "\n")?;

    Ok(())
}

fn next_free_id(taken: impl Iterator<Item = u32>) -> u32 {
    taken
        .filter(|id| *id >= FIRST_DYNAMIC_ID)
        .max()
        .map(|id| id + 1)
        .unwrap_or(FIRST_DYNAMIC_ID)
}

fn apply_group(root: &Path, group: &GroupSpec) -> Result<()> {
    let path = root.join("etc/group");
    let mut lines = read_lines(&path)?;

    if lines
        .iter()
        .any(|l| l.split(':').next() == Some(group.name.as_str()))
    {
        debug!(group = %group.name, "group already present");
        return Ok(());
    }

    let gid = group.gid.unwrap_or_else(|| {
        next_free_id(lines.iter().filter_map(|l| {
            l.split(':').nth(2).and_then(|v| v.parse().ok())
        }))
    });

    lines.push(format!("{}:x:{}:", group.name, gid));
    write_lines(&path, &lines)
}

fn apply_user(root: &Path, user: &UserSpec) -> Result<()> {
    let passwd_path = root.join("etc/passwd");
    let mut passwd = read_lines(&passwd_path)?;

    if passwd
        .iter()
        .any(|l| l.split(':').next() == Some(user.name.as_str()))
    {
        debug!(user = %user.name, "user already present");
        return Ok(());
    }

    let uid = user.uid.unwrap_or_else(|| {
        next_free_id(passwd.iter().filter_map(|l| {
            l.split(':').nth(2).and_then(|v| v.parse().ok())
        }))
    });
    let gid = user.gid.unwrap_or(uid);

    // A matching primary group comes into existence with the user.
    apply_group(
        root,
        &GroupSpec {
            name: user.name.clone(),
            gid: Some(gid),
        },
    )?;

    let home = user
        .home
        .clone()
        .unwrap_or_else(|| format!("/home/{}", user.name));
    let shell = user
        .shell
        .clone()
        .unwrap_or_else(|| "/usr/sbin/nologin".to_string());

    passwd.push(format!(
        "{}:x:{}:{}::{}:{}",
        user.name, uid, gid, home, shell
    ));
    write_lines(&passwd_path, &passwd)?;

    let shadow_path = root.join("etc/shadow");
    let mut shadow = read_lines(&shadow_path)?;
    shadow.push(format!("{}:!::0:99999:7:::", user.name));
    write_lines(&shadow_path, &shadow)?;

    // Home directory, owned by the fresh ids when we can chown.
    let home_dir = root.join(home.trim_start_matches('/'));
    std::fs::create_dir_all(&home_dir)?;

    for group in &user.groups {
        add_group_member(root, group, &user.name)?;
    }

    Ok(())
}

fn add_group_member(root: &Path, group: &str, member: &str) -> Result<()> {
    let path = root.join("etc/group");
    let mut lines = read_lines(&path)?;

    let mut found = false;

    for line in lines.iter_mut() {
        let mut parts = line.split(':').map(str::to_string).collect::<Vec<_>>();
        if parts.first().map(String::as_str) != Some(group) {
            continue;
        }

        found = true;

        while parts.len() < 4 {
            parts.push(String::new());
        }

        let members = &mut parts[3];
        if !members.split(',').any(|m| m == member) {
            if members.is_empty() {
                *members = member.to_string();
            } else {
                members.push(',');
                members.push_str(member);
            }
        }

        *line = parts.join(":");
    }

    if !found {
        warn!(group, member, "supplementary group does not exist; creating");
        apply_group(root, &GroupSpec { name: group.to_string(), gid: None })?;
        return add_group_member(root, group, member);
    }

    write_lines(&path, &lines)
}

fn apply_file(root: &Path, file: &FileSpec) -> Result<()> {
    let path = root.join(file.path.trim_start_matches('/'));

    if file.directory {
        std::fs::create_dir_all(&path)?;
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(&path, b"")?;
        }
    }

    if let Some(mode) = &file.mode {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(parse_mode(mode)?))?;
    }

    Ok(())
}

fn apply_content(root: &Path, content: &ContentSpec) -> Result<()> {
    let path = root.join(content.path.trim_start_matches('/'));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, content.data.as_bytes())?;

    if let Some(mode) = &content.mode {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(parse_mode(mode)?))?;
    }

    Ok(())
}

fn run_command(root: &Path, command: &str) -> Result<()> {
    debug!(command, "running recipe command");

    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(root)
        .status()
        .map_err(|e| BuildError::SecondStageFailure(format!("sh -c {:?}: {}", command, e)))?;

    if !status.success() {
        return Err(BuildError::SecondStageFailure(format!(
            "command {:?} exited with {}",
            command, status
        )));
    }

    Ok(())
}

/// Delete paths matching the slim pattern set.
///
/// Only files are deleted directly; a directory matching a delete
/// pattern goes away only once nothing preserved remains inside it.
fn slim_tree(root: &Path, patterns: &SlimPatterns) -> Result<()> {
    let as_absolute = |path: &Path| -> String {
        format!(
            "/{}",
            path.strip_prefix(root)
                .expect("walked path is under root")
                .display()
        )
    };

    let mut doomed: Vec<PathBuf> = Vec::new();

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            BuildError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        if entry.file_type().is_dir() {
            continue;
        }

        if patterns.should_remove(&as_absolute(entry.path())) {
            doomed.push(entry.path().to_path_buf());
        }
    }

    for path in doomed {
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "slimmed");
    }

    // Emptied directories that themselves match a delete pattern.
    for entry in walkdir::WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| {
            BuildError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        if entry.file_type().is_dir()
            && patterns.should_remove(&as_absolute(entry.path()))
            && std::fs::read_dir(entry.path())?.next().is_none()
        {
            std::fs::remove_dir(entry.path())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn merge_usr_moves_and_symlinks() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("bin"))?;
        std::fs::write(dir.path().join("bin/sh"), "shell")?;
        std::fs::create_dir_all(dir.path().join("usr/bin"))?;
        std::fs::write(dir.path().join("usr/bin/env"), "env")?;

        merge_usr(dir.path())?;

        // Contents moved and the top-level path is now a symlink.
        assert_eq!(std::fs::read(dir.path().join("usr/bin/sh"))?, b"shell");
        assert_eq!(std::fs::read(dir.path().join("usr/bin/env"))?, b"env");

        let link = std::fs::read_link(dir.path().join("bin"))?;
        assert_eq!(link, PathBuf::from("usr/bin"));

        // Resolution through the symlink works.
        assert_eq!(std::fs::read(dir.path().join("bin/sh"))?, b"shell");

        Ok(())
    }

    #[test]
    fn merge_usr_identical_collision_collapses() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("lib"))?;
        std::fs::write(dir.path().join("lib/libc.so"), "same")?;
        std::fs::create_dir_all(dir.path().join("usr/lib"))?;
        std::fs::write(dir.path().join("usr/lib/libc.so"), "same")?;

        merge_usr(dir.path())?;

        assert_eq!(std::fs::read(dir.path().join("usr/lib/libc.so"))?, b"same");

        Ok(())
    }

    #[test]
    fn merge_usr_differing_collision_fails() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("lib"))?;
        std::fs::write(dir.path().join("lib/libc.so"), "one")?;
        std::fs::create_dir_all(dir.path().join("usr/lib"))?;
        std::fs::write(dir.path().join("usr/lib/libc.so"), "two")?;

        assert!(matches!(
            merge_usr(dir.path()),
            Err(BuildError::UsrMergeCollision(_))
        ));

        Ok(())
    }

    #[test]
    fn merge_usr_skips_already_merged() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("usr/bin"))?;
        std::os::unix::fs::symlink("usr/bin", dir.path().join("bin"))?;

        merge_usr(dir.path())?;

        assert!(std::fs::symlink_metadata(dir.path().join("bin"))?
            .file_type()
            .is_symlink());

        Ok(())
    }

    #[test]
    fn users_and_groups_are_applied() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("etc"))?;
        std::fs::write(dir.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n")?;
        std::fs::write(dir.path().join("etc/group"), "root:x:0:\nwww-data:x:33:\n")?;

        apply_user(
            dir.path(),
            &UserSpec {
                name: "app".to_string(),
                uid: Some(1000),
                gid: None,
                home: Some("/srv/app".to_string()),
                shell: None,
                groups: vec!["www-data".to_string()],
            },
        )?;

        let passwd = std::fs::read_to_string(dir.path().join("etc/passwd"))?;
        assert!(passwd.contains("app:x:1000:1000::/srv/app:/usr/sbin/nologin"));

        let group = std::fs::read_to_string(dir.path().join("etc/group"))?;
        assert!(group.contains("app:x:1000:"));
        assert!(group.contains("www-data:x:33:app"));

        let shadow = std::fs::read_to_string(dir.path().join("etc/shadow"))?;
        assert!(shadow.contains("app:!::0:99999:7:::"));

        assert!(dir.path().join("srv/app").is_dir());

        // Idempotent.
        apply_user(
            dir.path(),
            &UserSpec {
                name: "app".to_string(),
                ..Default::default()
            },
        )?;
        let passwd_again = std::fs::read_to_string(dir.path().join("etc/passwd"))?;
        assert_eq!(passwd, passwd_again);

        Ok(())
    }

    #[test]
    fn dynamic_ids_start_at_1000() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("etc"))?;
        std::fs::write(dir.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n")?;

        apply_user(
            dir.path(),
            &UserSpec {
                name: "first".to_string(),
                ..Default::default()
            },
        )?;
        apply_user(
            dir.path(),
            &UserSpec {
                name: "second".to_string(),
                ..Default::default()
            },
        )?;

        let passwd = std::fs::read_to_string(dir.path().join("etc/passwd"))?;
        assert!(passwd.contains("first:x:1000:1000"));
        assert!(passwd.contains("second:x:1001:1001"));

        Ok(())
    }

    #[test]
    fn files_and_content_are_applied() -> Result<()> {
        let dir = root();

        apply_file(
            dir.path(),
            &FileSpec {
                path: "/var/log/app".to_string(),
                directory: true,
                mode: Some("0750".to_string()),
            },
        )?;

        apply_content(
            dir.path(),
            &ContentSpec {
                path: "/etc/motd".to_string(),
                data: "welcome\n".to_string(),
                mode: Some("0644".to_string()),
            },
        )?;

        assert!(dir.path().join("var/log/app").is_dir());
        let mode = std::fs::metadata(dir.path().join("var/log/app"))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o750);

        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/motd"))?,
            "welcome\n"
        );

        Ok(())
    }

    #[test]
    fn commands_run_relative_to_root() -> Result<()> {
        let dir = root();

        run_command(dir.path(), "echo marker > witness")?;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("witness"))?.trim(),
            "marker"
        );

        assert!(run_command(dir.path(), "exit 3").is_err());

        Ok(())
    }

    #[test]
    fn slim_prunes_matching_paths() -> Result<()> {
        let dir = root();

        std::fs::create_dir_all(dir.path().join("usr/share/doc/dash"))?;
        std::fs::write(dir.path().join("usr/share/doc/dash/changelog.gz"), "log")?;
        std::fs::write(dir.path().join("usr/share/doc/dash/copyright"), "(c)")?;
        std::fs::create_dir_all(dir.path().join("usr/bin"))?;
        std::fs::write(dir.path().join("usr/bin/dash"), "elf")?;

        slim_tree(dir.path(), &SlimPatterns::default_set())?;

        assert!(!dir.path().join("usr/share/doc/dash/changelog.gz").exists());
        assert!(dir.path().join("usr/share/doc/dash/copyright").exists());
        assert!(dir.path().join("usr/bin/dash").exists());

        Ok(())
    }
}
