// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::DeployError;
use crate::service::Fixup;
use goblin::elf::Elf;
use goblin::elf::program_header::PT_INTERP;
use log::info;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const EXECUTABLE_MODE: u32 = 0o755;

/// Prepare a staged artifact for execution. Only ever called on the staging
/// copy, never on the installed artifact.
pub fn apply(service: &str, staged: &Path, fixup: &Fixup) -> Result<(), DeployError> {
    if let Some(ref loader) = fixup.loader {
        let mut bytes = fs::read(staged)
            .map_err(|e| DeployError::Fixup(format!("reading {}: {e}", staged.display())))?;
        if let Some(previous) = patch_loader(&mut bytes, loader)? {
            fs::write(staged, &bytes)
                .map_err(|e| DeployError::Fixup(format!("writing {}: {e}", staged.display())))?;
            info!("[{service}] rewrote program interpreter {previous} -> {loader}");
        }
    }

    fs::set_permissions(staged, fs::Permissions::from_mode(EXECUTABLE_MODE))
        .map_err(|e| DeployError::Fixup(format!("chmod {}: {e}", staged.display())))
}

/// Point an ELF executable at a different program interpreter (dynamic
/// loader). The new path has to fit in the existing `PT_INTERP` segment.
/// Returns the previous interpreter when the image was modified.
pub fn patch_loader(bytes: &mut [u8], loader: &str) -> Result<Option<String>, DeployError> {
    let (offset, size, current) = {
        let elf = Elf::parse(bytes).map_err(|e| DeployError::Fixup(format!("not an ELF image: {e}")))?;
        let interp = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == PT_INTERP)
            .ok_or_else(|| DeployError::Fixup("ELF image has no PT_INTERP segment".to_string()))?;
        (
            interp.p_offset as usize,
            interp.p_filesz as usize,
            elf.interpreter.unwrap_or_default().to_string(),
        )
    };

    if current == loader {
        return Ok(None);
    }
    // Room for the trailing NUL.
    if loader.len() + 1 > size {
        return Err(DeployError::Fixup(format!(
            "loader path {loader} does not fit in {size} byte PT_INTERP segment"
        )));
    }

    let segment = bytes
        .get_mut(offset..offset + size)
        .ok_or_else(|| DeployError::Fixup("PT_INTERP segment out of bounds".to_string()))?;
    segment.fill(0);
    segment[..loader.len()].copy_from_slice(loader.as_bytes());
    Ok(Some(current))
}
