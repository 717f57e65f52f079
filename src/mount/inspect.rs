use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parses `/proc/self/mounts`: `source mountpoint type options dump pass`.
pub fn parse_proc_mounts(contents: &str) -> Vec<MountEntry> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        out.push(MountEntry {
            source: unescape_octal(fields[0]),
            mountpoint: PathBuf::from(unescape_octal(fields[1])),
            fs_type: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        });
    }
    out
}

/// Parses BSD `mount` output: `source on /mountpoint (type, opt, opt)`.
pub fn parse_bsd_mounts(contents: &str) -> Vec<MountEntry> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let Some((source, rest)) = line.split_once(" on ") else {
            continue;
        };
        let Some(open) = rest.rfind(" (") else {
            continue;
        };
        let mountpoint = &rest[..open];
        let mut attrs = rest[open + 2..]
            .trim_end_matches(')')
            .split(',')
            .map(|s| s.trim().to_string());
        let fs_type = attrs.next().unwrap_or_default();
        out.push(MountEntry {
            source: source.to_string(),
            mountpoint: PathBuf::from(mountpoint),
            fs_type,
            options: attrs.collect(),
        });
    }
    out
}

pub fn mountpoint_is_mounted(entries: &[MountEntry], mountpoint: &Path) -> bool {
    find_mountpoint(entries, mountpoint).is_some()
}

pub fn find_mountpoint<'a>(entries: &'a [MountEntry], mountpoint: &Path) -> Option<&'a MountEntry> {
    let wanted = mountpoint
        .canonicalize()
        .unwrap_or_else(|_| mountpoint.to_path_buf());
    entries
        .iter()
        .rev()
        .find(|entry| entry.mountpoint == wanted || entry.mountpoint == mountpoint)
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
user@nas:/srv/backup /home/ann/.rdiffvault/ssh fuse.sshfs rw,nosuid,nodev 0 0
encfs /home/ann/.rdiffvault/plain fuse.encfs rw,nosuid,nodev 0 0
/dev/sdb1 /media/usb\\040stick vfat ro,nosuid 0 0
";

    #[test]
    fn proc_mounts_are_parsed() {
        let entries = parse_proc_mounts(PROC);
        assert_eq!(entries.len(), 4);
        assert!(mountpoint_is_mounted(
            &entries,
            Path::new("/home/ann/.rdiffvault/ssh")
        ));
        assert!(!mountpoint_is_mounted(&entries, Path::new("/home/ann/.rdiffvault/smb")));
        let usb = find_mountpoint(&entries, Path::new("/media/usb stick")).expect("usb");
        assert_eq!(usb.options[0], "ro");
        assert_eq!(usb.fs_type, "vfat");
    }

    #[test]
    fn bsd_mounts_are_parsed() {
        let text = "\
/dev/disk1s1 on / (apfs, local, journaled)
//ann@nas/backup on /Users/ann/.rdiffvault/smb (smbfs, nodev, nosuid, mounted by ann)
";
        let entries = parse_bsd_mounts(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].fs_type, "smbfs");
        assert_eq!(entries[1].mountpoint, PathBuf::from("/Users/ann/.rdiffvault/smb"));
        assert_eq!(entries[1].options[0], "nodev");
    }
}
