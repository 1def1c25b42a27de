use std::io::Write;

use crate::digest::Digest;
use crate::Result;

use super::{ObjectKind, Storable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
}

impl Storable for Blob {
    const KIND: ObjectKind = ObjectKind::Blob;

    fn payload(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn parse(payload: &[u8], _: &Digest) -> Result<Self> {
        Ok(Self::new(payload.to_vec()))
    }
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pretty-printing a blob is simple - just dump the contents to `out`
    pub fn pretty_print(&self, mut out: impl Write) -> std::io::Result<()> {
        out.write_all(&self.data)?;
        out.flush()
    }
}
