use super::Transport;

use glob::glob;
use nix::errno::Errno;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
pub use serialport::TTYPort as NativePort;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;

pub fn is_port_open(port_name: &str) -> bool {
    let paths = match glob("/proc/[0-9]*/fd/*") {
        Ok(paths) => paths,
        Err(_) => return false,
    };

    paths
        .filter_map(|p| p.ok())
        .filter_map(|path| fs::read_link(path).ok())
        .any(|link| link.to_str() == Some(port_name))
}

fn errno_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

impl Transport for NativePort {
    fn set_min_read(&mut self, len: u8) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let mut stios = termios::tcgetattr(fd).map_err(errno_to_io)?;

        stios.control_chars[SpecialCharacterIndices::VMIN as usize] = len;
        stios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(fd, SetArg::TCSANOW, &stios).map_err(errno_to_io)
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone_native()?))
    }
}
