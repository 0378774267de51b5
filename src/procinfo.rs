//! Process observation primitives.
//!
//! Everything here reads the OS process table (`/proc` on Linux) or sends
//! signals; nothing holds state. The supervisor uses these to refresh status
//! snapshots, the instance controller uses them to validate persisted pids and
//! to drive the interrupt/kill escalation.

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Signals the controller is allowed to deliver to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful interrupt (SIGINT).
    Interrupt,
    /// Forceful kill (SIGKILL).
    Kill,
}

impl Signal {
    fn raw(self) -> i32 {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Returns true if a process with this pid currently exists.
///
/// A pid we are not allowed to signal (EPERM) still exists.
pub fn alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Reads the command line of a process, with NUL separators replaced by
/// spaces. Returns `None` when the process is gone or unreadable.
pub fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let text: String = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part))
        .collect::<Vec<_>>()
        .join(" ");
    Some(text)
}

/// Process group id of a pid, when the process still exists.
pub fn group_of(pid: u32) -> Option<i32> {
    let pgid = unsafe { libc::getpgid(pid as i32) };
    if pgid < 0 {
        None
    } else {
        Some(pgid)
    }
}

/// Sends a signal to every member of a process group.
pub fn signal_group(pgid: i32, signal: Signal) -> io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, signal.raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Returns true while at least one member of the process group exists.
pub fn group_alive(pgid: i32) -> bool {
    let rc = unsafe { libc::kill(-pgid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Resident set size of a process in bytes, from `/proc/<pid>/status`.
pub fn rss_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Pids of all live descendants of `pid` (children, grandchildren, ...),
/// discovered by walking `/proc/*/stat` parent links.
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(candidate) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", candidate)) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            children.entry(ppid).or_default().push(candidate);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![pid];
    while let Some(next) = queue.pop() {
        if let Some(kids) = children.get(&next) {
            for kid in kids {
                found.push(*kid);
                queue.push(*kid);
            }
        }
    }
    found.sort_unstable();
    found
}

// The comm field may contain spaces and parentheses; the ppid is the second
// field after the closing paren.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(1)?.parse().ok()
}

/// Ports in LISTEN state owned by any of the given pids.
///
/// Socket inodes are collected from `/proc/<pid>/fd` and matched against the
/// kernel connection tables.
pub fn listening_ports(pids: &[u32]) -> Vec<u16> {
    let mut inodes = Vec::new();
    for pid in pids {
        let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", pid)) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            if let Some(inode) = parse_socket_inode(&target.to_string_lossy()) {
                inodes.push(inode);
            }
        }
    }

    let mut ports: Vec<u16> = listen_table()
        .into_iter()
        .filter(|(_, inode)| inodes.contains(inode))
        .map(|(port, _)| port)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Every port currently in LISTEN state on the host, regardless of owner.
pub fn all_listening_ports() -> Vec<u16> {
    let mut ports: Vec<u16> = listen_table().into_iter().map(|(port, _)| port).collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn listen_table() -> Vec<(u16, u64)> {
    let mut entries = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(raw) = std::fs::read_to_string(Path::new(table)) else {
            continue;
        };
        for line in raw.lines().skip(1) {
            if let Some(entry) = parse_listen_entry(line) {
                entries.push(entry);
            }
        }
    }
    entries
}

// Parses one `/proc/net/tcp` row into (local port, socket inode), keeping
// only sockets in LISTEN state (0x0A).
fn parse_listen_entry(line: &str) -> Option<(u16, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 || fields[3] != "0A" {
        return None;
    }
    let port_hex = fields[1].rsplit(':').next()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode = fields[9].parse().ok()?;
    Some((port, inode))
}

fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(alive(std::process::id()));
        assert!(!alive(0));
    }

    #[test]
    fn parses_listen_entries() {
        let listening = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 43210 1 0000000000000000 100 0 0 10 0";
        assert_eq!(parse_listen_entry(listening), Some((0x1F90, 43210)));

        let established = "   1: 0100007F:1F90 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 43211 1 0000000000000000 100 0 0 10 0";
        assert_eq!(parse_listen_entry(established), None);
    }

    #[test]
    fn parses_socket_inodes() {
        assert_eq!(parse_socket_inode("socket:[43210]"), Some(43210));
        assert_eq!(parse_socket_inode("pipe:[999]"), None);
        assert_eq!(parse_socket_inode("/dev/null"), None);
    }

    #[test]
    fn parses_stat_ppid_with_spaces_in_comm() {
        let stat = "123 (tmux: server) S 77 123 123 0 -1 4194304 100 0 0 0 1 1 0 0";
        assert_eq!(parse_stat_ppid(stat), Some(77));
    }

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tcat\nVmPeak:\t  1000 kB\nVmRSS:\t    512 kB\n";
        assert_eq!(parse_vm_rss(status), Some(512 * 1024));
        assert_eq!(parse_vm_rss("Name:\tcat\n"), None);
    }
}
