//! Content-addressed object storage.
//!
//! Objects live at `objects/<2 hex>/<62 hex>`, zlib-compressed in their framed form. The store
//! never rewrites a file once it exists, and re-hashes the bytes on every read, so damage on disk
//! surfaces as [`Error::Corrupt`] instead of altered content.

use std::io::{ErrorKind, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rayon::prelude::*;
use tracing::*;
use walkdir::WalkDir;

use crate::digest::Digest;
use crate::object::{self, Blob, Commit, Object, ObjectKind, Storable, Tree};
use crate::options::Options;
use crate::util;
use crate::{Error, Result};

pub struct ObjectStore {
    root: Utf8PathBuf,
    options: Options,
}

impl ObjectStore {
    pub fn new(objects_dir: impl AsRef<Utf8Path>, options: Options) -> Self {
        Self {
            root: objects_dir.as_ref().to_owned(),
            options,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Store an object and return its digest. Storing content that is already present is a
    /// no-op returning the same digest.
    pub fn put<T: Storable>(&self, obj: &T) -> Result<Digest> {
        self.write_framed(&obj.formatted())
    }

    /// Store a raw payload of the given kind. The payload must parse as that kind.
    pub fn put_raw(&self, kind: ObjectKind, payload: &[u8]) -> Result<Digest> {
        let formatted = object::frame(kind, payload);
        let digest = Digest::new(&formatted);
        Object::parse(kind, payload, &digest)?;
        self.write_framed(&formatted)
    }

    fn write_framed(&self, formatted: &[u8]) -> Result<Digest> {
        let digest = Digest::new(formatted);
        let object_path = self.object_path(&digest);

        if object_path.exists() {
            trace!(digest = %digest.short(), "Object already stored");
            return Ok(digest);
        }

        trace!(digest = %digest.short(), len = formatted.len(), "Writing object to database");

        let dirname = object_path.parent().unwrap_or(&self.root);
        if !dirname.is_dir() {
            std::fs::create_dir_all(dirname)?;
        }

        let mut e = ZlibEncoder::new(
            Vec::with_capacity(formatted.len() / 2),
            self.options.compression(),
        );
        e.write_all(formatted)?;
        let compressed_bytes = e.finish()?;

        // Concurrent writers of the same digest race to rename identical bytes into place.
        util::write_atomic(&object_path, &compressed_bytes, self.options.fsync)?;

        Ok(digest)
    }

    fn object_path(&self, digest: &Digest) -> Utf8PathBuf {
        let hex = digest.to_hex();
        let (prefix, suffix) = hex.split_at(2);
        self.root.join(prefix).join(suffix)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    /// Read, inflate and re-hash an object, returning its kind and payload.
    fn read_verified(&self, digest: &Digest) -> Result<(ObjectKind, Vec<u8>)> {
        trace!(digest = %digest.short(), "Reading object from database");

        let compressed = match std::fs::read(self.object_path(digest)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(digest.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut decompressed = Vec::new();
        ZlibDecoder::new(&*compressed)
            .read_to_end(&mut decompressed)
            .map_err(|e| Error::corrupt(digest, format!("cannot inflate: {e}")))?;

        if Digest::new(&decompressed) != *digest {
            return Err(Error::corrupt(digest, "content does not match digest"));
        }

        let (kind, payload_len) = {
            let (kind, payload) = object::unframe(&decompressed, digest)?;
            (kind, payload.len())
        };
        let header_len = decompressed.len() - payload_len;
        decompressed.drain(..header_len);

        Ok((kind, decompressed))
    }

    /// Load an object, failing with [`Error::KindMismatch`] if it is not of kind `expected`.
    pub fn get(&self, digest: &Digest, expected: ObjectKind) -> Result<Object> {
        let (kind, payload) = self.read_verified(digest)?;
        if kind != expected {
            return Err(Error::KindMismatch {
                digest: digest.clone(),
                expected,
                actual: kind,
            });
        }
        Object::parse(kind, &payload, digest)
    }

    /// Load an object of whatever kind it is.
    pub fn load(&self, digest: &Digest) -> Result<Object> {
        let (kind, payload) = self.read_verified(digest)?;
        Object::parse(kind, &payload, digest)
    }

    pub fn read_kind(&self, digest: &Digest) -> Result<ObjectKind> {
        Ok(self.load(digest)?.kind())
    }

    pub fn get_blob(&self, digest: &Digest) -> Result<Blob> {
        self.get_typed(digest, Object::into_blob)
    }

    pub fn get_tree(&self, digest: &Digest) -> Result<Tree> {
        self.get_typed(digest, Object::into_tree)
    }

    pub fn get_commit(&self, digest: &Digest) -> Result<Commit> {
        self.get_typed(digest, Object::into_commit)
    }

    fn get_typed<T: Storable>(
        &self,
        digest: &Digest,
        extract: impl FnOnce(Object) -> Option<T>,
    ) -> Result<T> {
        let object = self.get(digest, T::KIND)?;
        let actual = object.kind();
        extract(object).ok_or(Error::KindMismatch {
            digest: digest.clone(),
            expected: T::KIND,
            actual,
        })
    }

    /// Every digest in the store, in no particular order.
    pub fn digests(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();

        if !self.root.is_dir() {
            return Ok(digests);
        }

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let (Some(prefix), Some(suffix)) = (
                entry.path().parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()),
                entry.file_name().to_str(),
            ) else {
                continue;
            };
            // Skips temp files of in-flight writes.
            if let Ok(digest) = format!("{prefix}{suffix}").parse::<Digest>() {
                digests.push(digest);
            }
        }

        Ok(digests)
    }

    /// All stored digests whose hex form starts with `prefix`, sorted.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Digest>> {
        let prefix = prefix.to_ascii_lowercase();
        let mut found = self
            .digests()?
            .into_iter()
            .filter(|digest| digest.to_hex().starts_with(&prefix))
            .collect::<Vec<_>>();
        found.sort();
        Ok(found)
    }

    /// Check every stored object in parallel. Returns the broken ones, sorted by digest.
    pub fn verify_all(&self) -> Result<Vec<(Digest, Error)>> {
        let digests = self.digests()?;
        debug!(count = digests.len(), "Verifying objects");

        let mut broken = digests
            .into_par_iter()
            .filter_map(|digest| match self.load(&digest) {
                Ok(_) => None,
                Err(e) => Some((digest, e)),
            })
            .collect::<Vec<_>>();
        broken.sort_by(|a, b| a.0.cmp(&b.0));

        for (digest, error) in &broken {
            warn!(digest = %digest, %error, "Broken object");
        }
        Ok(broken)
    }
}
