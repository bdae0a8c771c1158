//! Device selection policy.
//!
//! The core only opens what it is given; this module turns the catalog and
//! the user's preferences into ordered candidate lists.

use std::fmt::Write as _;

use hark_core::audio::device::mic_preference_score;
use hark_core::{DeviceCatalog, DeviceDescriptor, DeviceRef};
use tracing::{debug, info};

use crate::settings::AppSettings;

fn is_excluded(name: &str, excluded: &[String]) -> bool {
    let lowered = name.to_ascii_lowercase();
    excluded.iter().any(|k| lowered.contains(k.as_str()))
}

fn push_unique(out: &mut Vec<DeviceRef>, candidate: DeviceRef) {
    if !out.contains(&candidate) {
        out.push(candidate);
    }
}

/// Preferred device first (substring, case-insensitive, exclusions do not
/// apply), then the default device unless excluded, then the remaining
/// acceptable devices. Never empty.
fn rank(
    devices: &[DeviceDescriptor],
    preferred: Option<&str>,
    excluded: &[String],
    is_input: bool,
) -> Vec<DeviceRef> {
    let mut out = Vec::new();

    if let Some(pref) = preferred.map(str::to_ascii_lowercase) {
        match devices
            .iter()
            .find(|d| d.name.to_ascii_lowercase().contains(&pref))
        {
            Some(d) => push_unique(&mut out, DeviceRef::Name(d.name.clone())),
            None => debug!(preferred = %pref, "preferred device not present"),
        }
    }

    let acceptable = |d: &&DeviceDescriptor| {
        !is_excluded(&d.name, excluded) && !(is_input && d.is_loopback_like)
    };

    match devices.iter().find(|d| d.is_default) {
        Some(d) if acceptable(&d) => push_unique(&mut out, DeviceRef::Default),
        Some(_) => {}
        None => push_unique(&mut out, DeviceRef::Default),
    }

    let mut rest: Vec<&DeviceDescriptor> = devices
        .iter()
        .filter(|d| !d.is_default)
        .filter(acceptable)
        .collect();
    if is_input {
        // Stable sort keeps host order among equal scores.
        rest.sort_by_key(|d| -mic_preference_score(&d.name));
    }
    for d in rest {
        push_unique(&mut out, DeviceRef::Name(d.name.clone()));
    }

    if out.is_empty() {
        out.push(DeviceRef::Default);
    }
    out
}

pub fn input_candidates(
    devices: &[DeviceDescriptor],
    preferred: Option<&str>,
    excluded: &[String],
) -> Vec<DeviceRef> {
    rank(devices, preferred, excluded, true)
}

pub fn output_candidates(
    devices: &[DeviceDescriptor],
    preferred: Option<&str>,
    excluded: &[String],
) -> Vec<DeviceRef> {
    rank(devices, preferred, excluded, false)
}

/// Fill the candidate lists unless the settings file pinned them explicitly.
pub fn apply_policy(settings: &mut AppSettings, catalog: &dyn DeviceCatalog) {
    let pinned = |list: &[DeviceRef]| list != [DeviceRef::Default];
    let excluded = settings.excluded_device_keywords.clone();

    if !pinned(&settings.assistant.devices.input_candidates) {
        settings.assistant.devices.input_candidates = input_candidates(
            &catalog.list_input_devices(),
            settings.preferred_input_device.as_deref(),
            &excluded,
        );
    }
    if !pinned(&settings.assistant.devices.output_candidates) {
        settings.assistant.devices.output_candidates = output_candidates(
            &catalog.list_output_devices(),
            settings.preferred_output_device.as_deref(),
            &excluded,
        );
    }

    info!(
        input = %join(&settings.assistant.devices.input_candidates),
        output = %join(&settings.assistant.devices.output_candidates),
        "device candidates"
    );
}

fn join(list: &[DeviceRef]) -> String {
    list.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Human-readable listing for `--list-devices`.
pub fn describe(catalog: &dyn DeviceCatalog) -> String {
    let mut out = String::new();
    for (title, devices) in [
        ("Input devices", catalog.list_input_devices()),
        ("Output devices", catalog.list_output_devices()),
    ] {
        let _ = writeln!(out, "{title}:");
        if devices.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for d in devices {
            let mut flags = Vec::new();
            if d.is_default {
                flags.push("default");
            }
            if d.is_loopback_like {
                flags.push("loopback?");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            let _ = writeln!(out, "  {:>2}: {}{flags}", d.index, d.name);
        }
    }
    out
}
