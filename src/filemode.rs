use crate::object::ObjectKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct FileMode(pub u32);

impl std::fmt::Octal for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl FileMode {
    pub const DIRECTORY: FileMode = FileMode(0o040000);
    pub const EXECUTABLE: FileMode = FileMode(0o100755);
    pub const REGULAR: FileMode = FileMode(0o100644);
    pub const SYMLINK: FileMode = FileMode(0o120000);
    pub const GITLINK: FileMode = FileMode(0o160000);

    /// Parse the octal mode of a tree entry. Only the five modes above are accepted.
    pub fn from_octal(s: &str) -> Option<Self> {
        let mode = FileMode(u32::from_str_radix(s, 8).ok()?);
        [
            Self::DIRECTORY,
            Self::EXECUTABLE,
            Self::REGULAR,
            Self::SYMLINK,
            Self::GITLINK,
        ]
        .contains(&mode)
        .then_some(mode)
    }

    /// The kind of object an entry with this mode points at.
    pub fn kind(self) -> ObjectKind {
        match self {
            Self::DIRECTORY => ObjectKind::Tree,
            Self::GITLINK => ObjectKind::Commit,
            _ => ObjectKind::Blob,
        }
    }
}
