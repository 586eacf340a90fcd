#[cfg(target_family = "unix")]
use std::io;
#[cfg(target_family = "unix")]
use std::mem::MaybeUninit;

#[cfg(target_family = "unix")]
use crate::error::Result;

/// Raises the open-file limit; a proxy holds two sockets per session.
#[cfg(target_family = "unix")]
pub fn set_rlimit_nofile(limit: libc::rlim_t) -> Result<()> {
    unsafe {
        let mut rlimit = MaybeUninit::uninit();
        if libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) != 0 {
            return Err((io::Error::last_os_error()).into());
        }
        let mut rlimit = rlimit.assume_init();

        if rlimit.rlim_cur < limit {
            rlimit.rlim_cur = limit;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) != 0 {
                return Err((io::Error::last_os_error()).into());
            }
        }
    }

    Ok(())
}
