use std::io::Write;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::digest::Digest;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

use super::{ObjectKind, Storable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    name: String,
    email: String,
    when: Timestamp,
}

impl Signature {
    /// Characters that would break the `name <email>` line are dropped.
    pub fn new(name: &str, email: &str, when: Timestamp) -> Self {
        let clean = |s: &str| {
            s.chars()
                .filter(|c| !matches!(c, '<' | '>' | '\n' | '\0'))
                .collect::<String>()
                .trim()
                .to_owned()
        };
        Self {
            name: clean(name),
            email: clean(email),
            when,
        }
    }

    pub fn now(name: &str, email: &str) -> Self {
        Self::new(name, email, Timestamp::now())
    }

    /// Read the identity from `RIFT_AUTHOR_NAME` and `RIFT_AUTHOR_EMAIL`.
    pub fn from_env() -> Option<Self> {
        let name = std::env::var("RIFT_AUTHOR_NAME").ok()?;
        let email = std::env::var("RIFT_AUTHOR_EMAIL").ok()?;
        Some(Self::now(&name, &email))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn when(&self) -> &Timestamp {
        &self.when
    }

    /// Parse a signature line from a commit.
    ///
    /// ## Example
    /// `author Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100`
    fn parse(line: &str) -> Option<(&str, Self)> {
        static REGEX: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(author|committer) ([^<>]*) <([^<>]*)> (\d+ [+-]\d{4})$")
                .expect("signature regex is valid")
        });

        let groups = REGEX.captures(line)?;
        let role = groups.get(1)?.as_str();
        let when = Timestamp::parse(&groups[4])?;

        Some((
            role,
            Self {
                name: groups[2].to_owned(),
                email: groups[3].to_owned(),
                when,
            },
        ))
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.when)
    }
}

/// A snapshot of a tree plus the history it descends from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    tree: Digest,
    parents: Vec<Digest>,
    author: Signature,
    committer: Signature,
    message: String,
}

impl Commit {
    pub fn new(
        tree: Digest,
        parents: Vec<Digest>,
        author: Signature,
        committer: Signature,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parents,
            author,
            committer,
            message: message.into(),
        }
    }

    pub fn tree(&self) -> &Digest {
        &self.tree
    }

    pub fn parents(&self) -> &[Digest] {
        self.parents.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn author(&self) -> &Signature {
        &self.author
    }

    pub fn committer(&self) -> &Signature {
        &self.committer
    }

    pub fn message(&self) -> &str {
        self.message.as_ref()
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    pub fn pretty_print(&self, mut out: impl Write) -> std::io::Result<()> {
        out.write_all(&self.payload())?;
        out.flush()
    }
}

impl Storable for Commit {
    const KIND: ObjectKind = ObjectKind::Commit;

    fn payload(&self) -> Vec<u8> {
        let mut data = format!("tree {:x}\n", self.tree);
        for parent in &self.parents {
            data.push_str(&format!("parent {parent:x}\n"));
        }
        data.push_str(&format!("author {}\n", self.author));
        data.push_str(&format!("committer {}\n", self.committer));
        data.push('\n');
        data.push_str(&self.message);
        data.into_bytes()
    }

    /// Parse a commit payload.
    ///
    /// ## Example
    /// ```text
    /// tree 8d1f2d8dba1e2e5ac5a0cfc4d1b8e1a7c6e1f3b2a4c5d6e7f8091a2b3c4d5e6f
    /// parent 0c1d2e3f405162738495a6b7c8d9eafb0c1d2e3f405162738495a6b7c8d9eafb
    /// author Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
    /// committer Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
    ///
    /// Merge branch 'feature' into main
    /// ```
    fn parse(bytes: &[u8], digest: &Digest) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::corrupt(digest, "invalid utf-8 in commit"))?;
        let (headers, message) = text
            .split_once("\n\n")
            .ok_or_else(|| Error::corrupt(digest, "commit has no message separator"))?;

        let mut lines = headers.lines();
        let bad_line = |line: &str| Error::corrupt(digest, format!("unexpected line {line:?}"));
        let parse_digest = |line: &str, hex: &str| Digest::from_str(hex).map_err(|_| bad_line(line));

        let tree = match lines.next() {
            Some(line) => match line.strip_prefix("tree ") {
                Some(hex) => parse_digest(line, hex)?,
                None => return Err(bad_line(line)),
            },
            None => return Err(Error::corrupt(digest, "commit has no tree")),
        };

        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in lines {
            if let Some(hex) = line.strip_prefix("parent ") {
                if author.is_some() {
                    return Err(bad_line(line));
                }
                parents.push(parse_digest(line, hex)?);
                continue;
            }
            match Signature::parse(line) {
                Some(("author", sig)) if author.is_none() => author = Some(sig),
                Some(("committer", sig)) if author.is_some() && committer.is_none() => {
                    committer = Some(sig)
                }
                _ => return Err(bad_line(line)),
            }
        }

        Ok(Self {
            tree,
            parents,
            author: author.ok_or_else(|| Error::corrupt(digest, "commit has no author"))?,
            committer: committer
                .ok_or_else(|| Error::corrupt(digest, "commit has no committer"))?,
            message: message.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> Signature {
        Signature::new(
            "Jamie Quigley",
            "jamie@quigley.xyz",
            Timestamp::parse("1658312219 +0100").unwrap(),
        )
    }

    #[test]
    fn test_parse_signature() {
        let input = "author Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100";

        let (role, signature) = Signature::parse(input).unwrap();

        assert_eq!(role, "author");
        assert_eq!(signature.name, "Jamie Quigley");
        assert_eq!(signature.email, "jamie@quigley.xyz");
        assert_eq!(signature.when, Timestamp::parse("1658312219 +0100").unwrap());
    }

    #[test]
    fn test_signature_drops_angle_brackets() {
        let sig = Signature::new("Eve <evil>", "e@x\n", Timestamp::parse("0 +0000").unwrap());
        assert_eq!(sig.to_string(), "Eve evil <e@x> 0 +0000");
    }

    #[test]
    fn test_parse_commit() {
        let tree = Digest::new(b"tree");
        let p1 = Digest::new(b"p1");
        let p2 = Digest::new(b"p2");
        let input = format!(
            "tree {tree:x}
parent {p1:x}
parent {p2:x}
author Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
committer Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100

Merge branch 'feature' into main
"
        );

        let commit = Commit::parse(input.as_bytes(), &Digest::NULL).unwrap();
        assert_eq!(commit.tree, tree);
        assert_eq!(commit.parents, vec![p1, p2]);
        assert!(commit.is_merge());
        assert_eq!(commit.author, signature());
        assert_eq!(commit.committer, signature());
        assert_eq!(commit.message, "Merge branch 'feature' into main\n");
        assert_eq!(commit.summary(), "Merge branch 'feature' into main");

        assert_eq!(commit.payload(), input.as_bytes());
    }

    #[test]
    fn test_parent_order_is_part_of_identity() {
        let tree = Digest::new(b"tree");
        let (a, b) = (Digest::new(b"a"), Digest::new(b"b"));
        let ab = Commit::new(tree.clone(), vec![a.clone(), b.clone()], signature(), signature(), "m");
        let ba = Commit::new(tree, vec![b, a], signature(), signature(), "m");
        assert_ne!(ab.digest(), ba.digest());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let tree = Digest::new(b"tree");
        let inputs = [
            String::from("no separator"),
            format!("parent {tree:x}\n\nmsg"),
            format!("tree {tree:x}\nauthor nobody\n\nmsg"),
            format!(
                "tree {tree:x}\ncommitter A <a> 1 +0000\nauthor A <a> 1 +0000\n\nmsg"
            ),
            format!("tree {tree:x}\nauthor A <a> 1 +0000\n\nmsg"),
        ];
        for input in inputs {
            let err = Commit::parse(input.as_bytes(), &Digest::NULL).unwrap_err();
            assert!(matches!(err, Error::Corrupt { .. }), "{input}");
        }
    }
}
