use std::{
    borrow::Cow,
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Context as _, Result, anyhow};
use aya_build::{Package, Toolchain};
use cargo_metadata::{Artifact, CompilerMessage, Message, Target};

const EBPF_PACKAGE: &str = "flowlens-ebpf";

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_KERNEL");
    // The userspace pipeline builds on stable; only `kernel` needs bpf-linker.
    if env::var_os("CARGO_FEATURE_KERNEL").is_none() {
        return Ok(());
    }

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = ebpf_package;
    let ebpf_package = Package {
        name: name.as_str(),
        root_dir: manifest_path
            .parent()
            .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?
            .as_str(),
        ..Default::default()
    };
    build_ebpf(ebpf_package, Toolchain::default())
}

/// Builds the eBPF package for the bpf target matching the host endianness
/// and copies its binaries into `OUT_DIR`. Compiler output is forwarded
/// with an `[ebpf]` prefix.
fn build_ebpf(package: Package<'_>, toolchain: Toolchain<'_>) -> Result<()> {
    let out_dir = env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?;
    let out_dir = PathBuf::from(out_dir);

    let endian =
        env::var_os("CARGO_CFG_TARGET_ENDIAN").ok_or(anyhow!("CARGO_CFG_TARGET_ENDIAN not set"))?;
    let target = match endian.as_os_str().to_string_lossy().as_ref() {
        "big" => "bpfeb",
        "little" => "bpfel",
        other => return Err(anyhow!("unsupported endian={other}")),
    };
    let target = format!("{target}-unknown-none");

    let bpf_target_arch =
        env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let bpf_target_arch = target_arch_fixup(bpf_target_arch.into()).into_owned();

    let toolchain_name: Cow<'_, str> = match toolchain {
        Toolchain::Nightly => Cow::Borrowed("nightly"),
        Toolchain::Custom(spec) => Cow::Borrowed(spec),
    };
    let Package {
        name,
        root_dir,
        no_default_features,
        features,
    } = package;
    println!("cargo:rerun-if-changed={root_dir}");

    let mut cmd = Command::new("rustup");
    cmd.args([
        "run",
        toolchain_name.as_ref(),
        "cargo",
        "build",
        "--package",
        name,
        "-Z",
        "build-std=core",
        "--bins",
        "--message-format=json",
        "--release",
        "--target",
        &target,
    ]);
    if no_default_features {
        cmd.arg("--no-default-features");
    }
    if !features.is_empty() {
        cmd.args(["--features", &features.join(",")]);
    }

    const SEPARATOR: &str = "\x1f";
    let mut rustflags = OsString::new();
    for part in [
        "--cfg=bpf_target_arch=\"",
        &bpf_target_arch,
        "\"",
        SEPARATOR,
        "-Cdebuginfo=2",
        SEPARATOR,
        "-Clink-arg=--btf",
    ] {
        rustflags.push(part);
    }
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);
    for key in ["RUSTC", "RUSTC_WORKSPACE_WRAPPER"] {
        cmd.env_remove(key);
    }
    cmd.arg("--target-dir").arg(out_dir.join(name));

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;
    let Child { stdout, stderr, .. } = &mut child;

    let stderr = stderr.take().ok_or_else(|| anyhow!("child stderr not piped"))?;
    let stderr_handle = thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => eprintln!("[ebpf] {line}"),
                Err(err) => eprintln!("[ebpf] failed to read stderr: {err}"),
            }
        }
    });

    let stdout = stdout.take().ok_or_else(|| anyhow!("child stdout not piped"))?;
    let mut executables = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("invalid cargo message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target: Target { name, .. },
                ..
            }) => executables.push((name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                if let Some(rendered) = message.rendered {
                    for line in rendered.lines() {
                        eprintln!("[ebpf] {line}");
                    }
                }
            }
            Message::TextLine(line) => eprintln!("[ebpf] {line}"),
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    if !status.success() {
        return Err(anyhow!("{cmd:?} failed: {status:?}"));
    }
    stderr_handle
        .join()
        .unwrap_or_else(|err| std::panic::resume_unwind(err));

    for (name, binary) in executables {
        let dst = out_dir.join(name);
        fs::copy(&binary, &dst).with_context(|| format!("failed to copy {binary:?} to {dst:?}"))?;
    }
    Ok(())
}

fn target_arch_fixup(target_arch: Cow<'_, str>) -> Cow<'_, str> {
    if target_arch.starts_with("riscv64") {
        "riscv64".into()
    } else {
        target_arch
    }
}
