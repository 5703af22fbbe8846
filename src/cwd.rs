//! The minimal per-task working-directory handle (`SPEC_FULL.md` §4.4a).
//!
//! Process/task infrastructure is out of scope for this crate, but path
//! resolution still needs a starting point for relative paths. `Cwd` is
//! the smallest possible stand-in: one owned directory handle that a new
//! task clones via [`Cwd::reopen`] the way the original clones its `cwd`
//! field on fork.

use crate::device::BlockDevice;
use crate::directory::DirHandle;

pub struct Cwd<D: BlockDevice> {
    pub(crate) dir: DirHandle<D>,
}

impl<D: BlockDevice> Cwd<D> {
    pub(crate) fn new(dir: DirHandle<D>) -> Self {
        Self { dir }
    }

    /// Clone this working directory, e.g. when spawning a child task.
    pub fn reopen(&self) -> Self {
        Self {
            dir: self.dir.reopen(),
        }
    }

    pub fn inode_sector(&self) -> u32 {
        self.dir.inode_sector()
    }

    pub fn close(self) {
        self.dir.close();
    }
}
