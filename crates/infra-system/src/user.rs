// Unix account lookup for commands configured with `user`

use reactor_core::port::ExecutionError;
use std::path::PathBuf;
use tokio::process::Command;

/// Identity a command is switched to before exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Primary and supplementary groups
    pub groups: Vec<u32>,
    pub home: PathBuf,
}

/// Resolve a user name through the system password database
///
/// # Errors
/// - ExecutionError::UserLookup if the user is unknown or the lookup fails
pub fn lookup(name: &str) -> Result<Account, ExecutionError> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(Account {
            groups: group_list(name, user.gid)?,
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }),
        Ok(None) => Err(ExecutionError::UserLookup(format!("unknown user '{name}'"))),
        Err(e) => Err(ExecutionError::UserLookup(format!("{name}: {e}"))),
    }
}

#[cfg(target_os = "linux")]
fn group_list(name: &str, gid: nix::unistd::Gid) -> Result<Vec<u32>, ExecutionError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| ExecutionError::UserLookup(format!("invalid user name '{name}'")))?;
    let groups = nix::unistd::getgrouplist(&c_name, gid)
        .map_err(|e| ExecutionError::UserLookup(format!("groups of {name}: {e}")))?;
    Ok(groups.into_iter().map(|g| g.as_raw()).collect())
}

#[cfg(not(target_os = "linux"))]
fn group_list(_name: &str, gid: nix::unistd::Gid) -> Result<Vec<u32>, ExecutionError> {
    Ok(vec![gid.as_raw()])
}

/// Run the child as `account`, supplementary groups included
#[cfg(target_os = "linux")]
pub fn apply_identity(command: &mut Command, account: &Account) {
    use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

    let groups: Vec<Gid> = account.groups.iter().map(|g| Gid::from_raw(*g)).collect();
    let uid = Uid::from_raw(account.uid);
    let gid = Gid::from_raw(account.gid);
    // SAFETY: the closure only issues raw syscalls on data allocated before
    // fork. Groups are set first, while the child still holds privileges.
    unsafe {
        command.pre_exec(move || {
            if Uid::effective().is_root() {
                setgroups(&groups)?;
            }
            setgid(gid)?;
            setuid(uid)?;
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub fn apply_identity(command: &mut Command, account: &Account) {
    command.uid(account.uid).gid(account.gid);
}
