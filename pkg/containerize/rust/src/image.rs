// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Synthesis of the image build manifest.

use std::fmt;
use std::path::Path;

use crate::introspect::ProcessImage;
use crate::trace::{OpenedFile, TracedFileSet};

pub const MANIFEST: &str = "Dockerfile";
pub const PACKAGES_DIR: &str = "packages";
pub const WORKING_DIR: &str = "workingDirectory";
pub const APT_DIR: &str = "apt";
pub const EXTRA_FILES_DIR: &str = "extraFiles";
pub const SCRIPT_NAME: &str = "cmdScript.sh";

const IMAGE_WORKDIR: &str = "/workingDirectory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(String),
    Copy { src: String, dst: String },
    /// Shell commands run in order in a single layer.
    Run(Vec<String>),
    Expose(String),
    Workdir(String),
    Cmd(Vec<String>),
}

fn json_array(items: &[&str]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| String::from("[]"))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(image) => write!(f, "FROM {image}"),
            Instruction::Copy { src, dst } => write!(f, "COPY {}", json_array(&[src.as_str(), dst.as_str()])),
            Instruction::Run(commands) => write!(f, "RUN {}", commands.join(" && \\\n    ")),
            Instruction::Expose(port) => write!(f, "EXPOSE {port}"),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {dir}"),
            Instruction::Cmd(argv) => {
                let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
                write!(f, "CMD {}", json_array(&argv))
            }
        }
    }
}

/// Where and under which name the image is built.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub base_image: &'a str,
    pub repository: &'a str,
    pub program: &'a str,
    pub port: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub tag: String,
    /// Packages to repackage and install, in install order.
    pub packages: Vec<String>,
    /// Host paths mirrored into the image.
    pub copied_files: Vec<OpenedFile>,
    pub entrypoint_script: String,
    pub instructions: Vec<Instruction>,
}

impl ImageSpec {
    pub fn dockerfile(&self) -> String {
        let mut manifest = String::new();
        for instruction in &self.instructions {
            manifest.push_str(&instruction.to_string());
            manifest.push('\n');
        }
        manifest
    }
}

/// Image tag: non-alphanumeric characters of the program are dropped and the
/// port disambiguates programs converted more than once.
pub fn image_tag(repository: &str, program: &str, port: &str) -> String {
    let name: String = program
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{repository}/{name}:{port}")
}

/// Quotes a word for POSIX shells.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn entrypoint_script(image: &ProcessImage) -> String {
    let command: Vec<String> = std::iter::once(image.entrypoint_cmd.as_str())
        .chain(image.entrypoint_args.iter().map(String::as_str))
        .map(shell_quote)
        .collect();
    let command = command.join(" ");
    let cwd = shell_quote(&path_str(&image.cwd));
    let bin = shell_quote(&image.bin);

    format!(
        "#!/bin/sh\n\
         cd {cwd} || exit 1\n\
         if command -v strace >/dev/null 2>&1; then\n    \
             strace -f -e trace=%file -o {IMAGE_WORKDIR}/trace.log {command}\n\
         else\n    \
             {command}\n\
         fi\n\
         # Keep the container alive while a daemonized {bin} runs.\n\
         while ps -C {bin} >/dev/null 2>&1; do\n    \
             sleep 3\n\
         done\n"
    )
}

/// Derives the build instructions for a traced process. Executables owned by
/// no package are copied into the image as plain files.
pub fn synthesize(
    target: Target<'_>,
    image: &ProcessImage,
    packages: &[String],
    files: &TracedFileSet,
) -> ImageSpec {
    let mut copied_files = files.opened_files.clone();
    if packages.is_empty() && !copied_files.iter().any(|f| image.exe.starts_with(&f.path)) {
        copied_files.push(OpenedFile {
            path: image.exe.clone(),
            is_directory: false,
        });
        copied_files.sort();
    }

    let mut instructions = vec![
        Instruction::From(target.base_image.to_string()),
        Instruction::Copy {
            src: format!("{APT_DIR}/"),
            dst: "/etc/apt/".to_string(),
        },
    ];

    if packages.is_empty() {
        instructions.push(Instruction::Run(vec![
            "apt-get update".to_string(),
            "apt-get install -y --no-install-recommends rsync".to_string(),
        ]));
    } else {
        instructions.push(Instruction::Copy {
            src: format!("{PACKAGES_DIR}/"),
            dst: "/packages/".to_string(),
        });
        instructions.push(Instruction::Run(
            packages
                .iter()
                .map(|p| format!("dpkg -i --force-depends /packages/{}_*.deb", shell_quote(p)))
                .collect(),
        ));
    }

    if !files.directories_to_create.is_empty() {
        let dirs: Vec<String> = files
            .directories_to_create
            .iter()
            .map(|d| shell_quote(&path_str(d)))
            .collect();
        instructions.push(Instruction::Run(vec![format!("mkdir -p {}", dirs.join(" "))]));
    }

    instructions.push(Instruction::Copy {
        src: format!("{EXTRA_FILES_DIR}/"),
        dst: "/".to_string(),
    });

    if !files.symlinks.is_empty() {
        instructions.push(Instruction::Run(
            files
                .symlinks
                .iter()
                .map(|link| {
                    let parent = link.link_path.parent().unwrap_or(Path::new("/"));
                    format!(
                        "mkdir -p {} && (ln -sfn {} {} || true)",
                        shell_quote(&path_str(parent)),
                        shell_quote(&path_str(&link.real_path)),
                        shell_quote(&path_str(&link.link_path)),
                    )
                })
                .collect(),
        ));
    }

    instructions.push(Instruction::Run(vec![
        "rm -rf /packages /var/lib/apt/lists/* /var/cache/apt/archives/*.deb".to_string(),
    ]));

    let script = format!("{IMAGE_WORKDIR}/{SCRIPT_NAME}");
    instructions.extend([
        Instruction::Copy {
            src: format!("{WORKING_DIR}/{SCRIPT_NAME}"),
            dst: script.clone(),
        },
        Instruction::Run(vec![format!("chmod +x {script}")]),
        Instruction::Expose(target.port.to_string()),
        Instruction::Workdir(IMAGE_WORKDIR.to_string()),
        Instruction::Cmd(vec![script]),
    ]);

    ImageSpec {
        tag: image_tag(target.repository, target.program, target.port),
        packages: packages.to_vec(),
        copied_files,
        entrypoint_script: entrypoint_script(image),
        instructions,
    }
}
