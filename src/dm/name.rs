// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device-mapper device naming (spec §6, "DM name escaping and uuid
//! scheme"). A VG/LV pair maps onto exactly one device name in
//! `/dev/mapper`, and every literal `-` in either component must be
//! doubled so the single `-` left unescaped between them is
//! unambiguous.

/// `vg_name-lv_name[-layer]` with every `-` in each component doubled.
/// The separator before `layer` is omitted when `layer` starts with
/// `_` (e.g. `_mlog`), matching `dm_build_dm_name`.
pub fn mangled_device_name(vg_name: &str, lv_name: &str, layer: Option<&str>) -> String {
    let mut name = format!("{}-{}", escape_dashes(vg_name), escape_dashes(lv_name));
    if let Some(layer) = layer.filter(|l| !l.is_empty()) {
        if !layer.starts_with('_') {
            name.push('-');
        }
        name.push_str(&escape_dashes(layer));
    }
    name
}

fn escape_dashes(s: &str) -> String {
    s.replace('-', "--")
}

/// Inverse of `mangled_device_name`: split a DM device name back into
/// its VG and LV components. Fails if the name has no unescaped `-`,
/// which cannot happen for a name this crate produced but can for one
/// read back from the kernel's device list.
pub fn split_device_name(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'-' {
            if bytes[i + 1] == b'-' {
                i += 2;
                continue;
            }
            let vg = unescape_dashes(&name[..i]);
            let lv = unescape_dashes(&name[i + 1..]);
            return Some((vg, lv));
        }
        i += 1;
    }
    None
}

fn unescape_dashes(s: &str) -> String {
    s.replace("--", "-")
}

/// The DM UUID this crate stamps every device it creates with:
/// `LVM-<vg uuid, no dashes><lv uuid, no dashes>`, optionally suffixed
/// (e.g. `-mimage-0`) for internal layer devices that share an LV's
/// identity.
pub fn device_uuid(vg_uuid: &uuid::Uuid, lv_uuid: &uuid::Uuid, suffix: Option<&str>) -> String {
    let mut s = format!(
        "LVM-{}{}",
        vg_uuid.as_simple(),
        lv_uuid.as_simple()
    );
    if let Some(suffix) = suffix {
        s.push_str(suffix);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangled_name_doubles_embedded_dashes() {
        assert_eq!(mangled_device_name("my-vg", "my-lv", None), "my--vg-my--lv");
        assert_eq!(mangled_device_name("vg0", "lv0", None), "vg0-lv0");
    }

    #[test]
    fn layer_is_joined_with_a_dash_unless_it_starts_with_an_underscore() {
        assert_eq!(mangled_device_name("vg0", "lv0", Some("mimage-0")), "vg0-lv0-mimage--0");
        assert_eq!(mangled_device_name("vg0", "lv0", Some("_mlog")), "vg0-lv0_mlog");
        assert_eq!(mangled_device_name("vg0", "lv0", None), "vg0-lv0");
    }

    #[test]
    fn split_is_the_inverse_of_mangle() {
        for (vg, lv) in [("my-vg", "my-lv"), ("vg0", "lv0"), ("a--weird-vg", "plain")] {
            let mangled = mangled_device_name(vg, lv, None);
            assert_eq!(split_device_name(&mangled), Some((vg.to_string(), lv.to_string())));
        }
    }

    #[test]
    fn device_uuid_has_lvm_prefix_and_no_dashes_from_the_uuids() {
        let vg_uuid = uuid::Uuid::new_v4();
        let lv_uuid = uuid::Uuid::new_v4();
        let uuid = device_uuid(&vg_uuid, &lv_uuid, None);
        assert!(uuid.starts_with("LVM-"));
        assert!(!uuid[4..].contains('-'));

        let suffixed = device_uuid(&vg_uuid, &lv_uuid, Some("-mimage-0"));
        assert!(suffixed.ends_with("-mimage-0"));
    }
}
