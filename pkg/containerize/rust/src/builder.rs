// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Build context staging and image builds.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, info, warn};

use crate::errors::Error;
use crate::exec::{CommandExecutor, CommandSpec, run_checked};
use crate::image::{
    APT_DIR, EXTRA_FILES_DIR, ImageSpec, MANIFEST, PACKAGES_DIR, SCRIPT_NAME, WORKING_DIR,
};

async fn create_dir(path: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::image_build(format!("creating {}: {e}", path.display())))
}

async fn run(executor: &dyn CommandExecutor, spec: &CommandSpec) -> Result<(), Error> {
    run_checked(executor, spec)
        .await
        .map(|_| ())
        .map_err(|e| Error::image_build(e.to_string()))
}

/// Lays out everything the manifest refers to under `dir`, replacing any
/// context left by an earlier conversion of the same program.
pub async fn stage(
    executor: &dyn CommandExecutor,
    dir: &Path,
    spec: &ImageSpec,
) -> Result<(), Error> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        debug!("removing previous build context {}", dir.display());
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| Error::image_build(format!("removing {}: {e}", dir.display())))?;
    }

    let packages = dir.join(PACKAGES_DIR);
    let working = dir.join(WORKING_DIR);
    let apt = dir.join(APT_DIR);
    let extra = dir.join(EXTRA_FILES_DIR);
    for path in [&packages, &working, &apt, &extra] {
        create_dir(path).await?;
    }

    for package in &spec.packages {
        let repack = CommandSpec::new("dpkg-repack")
            .arg(package.as_str())
            .current_dir(&packages)
            .tolerate_diagnostics();
        run(executor, &repack).await?;
    }
    let debs = count_debs(&packages).await?;
    if debs == 0 && !spec.packages.is_empty() {
        warn!("repackaging produced no .deb files in {}", packages.display());
    }
    debug!("{debs} packages staged");

    let copy_apt = CommandSpec::new("cp")
        .args(["-a", "/etc/apt/."])
        .arg(apt.to_string_lossy());
    run(executor, &copy_apt).await?;

    for file in &spec.copied_files {
        let copy = CommandSpec::new("cp")
            .args(["-a", "--parents"])
            .arg(file.path.to_string_lossy())
            .arg(format!("{}/", extra.display()));
        run(executor, &copy).await?;
    }

    let script = working.join(SCRIPT_NAME);
    write_file(&script, &spec.entrypoint_script).await?;
    tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| Error::image_build(format!("chmod {}: {e}", script.display())))?;

    write_file(&dir.join(MANIFEST), &spec.dockerfile()).await?;
    info!("staged build context for {} in {}", spec.tag, dir.display());
    Ok(())
}

async fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| Error::image_build(format!("writing {}: {e}", path.display())))
}

async fn count_debs(dir: &Path) -> Result<usize, Error> {
    let list_error = |e| Error::image_build(format!("listing {}: {e}", dir.display()));
    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_error)?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
        if entry.path().extension().is_some_and(|ext| ext == "deb") {
            count += 1;
        }
    }
    Ok(count)
}

/// Builds the staged context in `dir` into an image tagged `tag`.
pub async fn build(executor: &dyn CommandExecutor, dir: &Path, tag: &str) -> Result<(), Error> {
    // BuildKit reports progress on stderr.
    let spec = CommandSpec::new("docker")
        .args(["build", "-t", tag])
        .arg(dir.to_string_lossy())
        .tolerate_diagnostics();
    info!("building image {tag}");
    run(executor, &spec).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Target, synthesize};
    use crate::introspect::ProcessImage;
    use crate::testing::ScriptedExecutor;
    use crate::trace::{OpenedFile, TracedFileSet};
    use std::fs;
    use std::path::PathBuf;

    fn spec(packages: &[&str]) -> ImageSpec {
        let image = ProcessImage {
            cmdline: "redis-server *:6379".to_string(),
            exe: PathBuf::from("/usr/bin/redis-server"),
            bin: "redis-server".to_string(),
            entrypoint_cmd: "redis-server".to_string(),
            entrypoint_args: vec!["*:6379".to_string()],
            cwd: PathBuf::from("/var/lib/redis"),
        };
        let files = TracedFileSet {
            opened_files: vec![OpenedFile {
                path: PathBuf::from("/etc/redis/redis.conf"),
                is_directory: false,
            }],
            ..Default::default()
        };
        let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
        let target = Target {
            base_image: "base",
            repository: "dd-agent",
            program: "redis-server",
            port: "6379",
        };
        synthesize(target, &image, &packages, &files)
    }

    #[tokio::test]
    async fn test_stage() {
        let dir = tempfile::tempdir().unwrap();
        let context = dir.path().join("redis-server");
        fs::create_dir_all(context.join("extraFiles/stale")).unwrap();
        let executor = ScriptedExecutor::new();
        let spec = spec(&["redis-tools", "redis-server"]);

        stage(&executor, &context, &spec).await.unwrap();

        let calls = executor.calls();
        assert_eq!(calls[0], vec!["dpkg-repack", "redis-tools"]);
        assert_eq!(calls[1], vec!["dpkg-repack", "redis-server"]);
        assert!(executor.ran(&["cp", "-a", "/etc/apt/."]));
        assert!(executor.ran(&["cp", "-a", "--parents", "/etc/redis/redis.conf"]));
        assert!(!context.join("extraFiles/stale").exists());

        let script = context.join("workingDirectory/cmdScript.sh");
        assert_eq!(fs::read_to_string(&script).unwrap(), spec.entrypoint_script);
        assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(
            fs::read_to_string(context.join("Dockerfile")).unwrap(),
            spec.dockerfile()
        );
    }

    #[tokio::test]
    async fn test_stage_copy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new();
        executor.on_output(
            &["cp", "-a", "--parents"],
            1,
            "",
            "cp: cannot stat '/etc/redis/redis.conf': No such file or directory",
        );

        let err = stage(&executor, dir.path(), &spec(&[])).await.unwrap_err();
        assert_eq!(err.kind(), "ImageBuildError");
    }

    #[tokio::test]
    async fn test_build() {
        let executor = ScriptedExecutor::new();
        executor.on_output(&["docker", "build"], 0, "", "#1 [internal] load build definition");
        build(&executor, Path::new("/space/redis-server"), "dd-agent/redisserver:6379")
            .await
            .unwrap();
        assert!(executor.ran(&[
            "docker",
            "build",
            "-t",
            "dd-agent/redisserver:6379",
            "/space/redis-server"
        ]));

        let executor = ScriptedExecutor::new();
        executor.on(&["docker", "build"], 1, "");
        let err = build(&executor, Path::new("/space/x"), "dd-agent/x:1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ImageBuildError");
    }
}
