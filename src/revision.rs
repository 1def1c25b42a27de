//! A revision is valid if it matches the following (informally defined) context-free grammar:
//! `<rev>` = `<refname>`
//! `<rev>` = `<rev>^`
//! `<rev>` = `<rev>~<num>`
//! `<num>` = a natural number
//! `<refname>` = a branch or tag name | a full ref name | a (partial) digest | "HEAD" or '@'

use std::str::FromStr;

use crate::{
    digest::Digest,
    refs::{is_valid_ref_name, RefName},
    repo::Repo,
    Error, Result,
};

#[derive(Debug, PartialEq, Eq)]
pub struct Rev {
    refname: Refname,
    distance: u64,
}

impl Rev {
    pub fn parse(mut input: &str) -> Result<Self> {
        let mut distance = 0u64;
        loop {
            if input.ends_with('^') {
                distance += 1;
                input = &input[..input.len() - 1];
            } else if let Some(idx) = input.rfind('~') {
                let steps = input[idx + 1..]
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidRevision(input.to_owned()))?;
                distance = distance
                    .checked_add(steps)
                    .ok_or_else(|| Error::InvalidRevision(input.to_owned()))?;
                input = &input[..idx];
            } else {
                let refname = Refname::parse(input)?;
                break Ok(Rev { refname, distance });
            }
        }
    }

    /// Resolve to a commit digest, following first parents `distance` times. Walking past a
    /// root commit, or naming an unbound reference, resolves to `None`.
    pub fn resolve(self, repo: &Repo) -> Result<Option<Digest>> {
        let Self { refname, distance } = self;

        let mut digest = match refname.resolve(repo)? {
            Some(x) => x,
            None => return Ok(None),
        };

        for _ in 0..distance {
            let commit = repo.store().get_commit(&digest)?;
            digest = match commit.parents().first() {
                Some(x) => x.clone(),
                None => return Ok(None),
            };
        }

        Ok(Some(digest))
    }
}

impl FromStr for Rev {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Refname {
    BranchTag(String),
    Full(Digest),
    PartialDigest(String),
    Head,
}

impl Refname {
    fn parse(input: &str) -> Result<Self> {
        if matches!(input, "HEAD" | "@") {
            return Ok(Self::Head);
        }

        if let Ok(digest) = Digest::from_str(input) {
            return Ok(Self::Full(digest));
        }

        if !input.is_empty() && input.chars().all(|c| c.is_ascii_hexdigit()) && input.len() < 64
        {
            return Ok(Self::PartialDigest(input.to_owned()));
        }

        if !is_valid_ref_name(input) {
            return Err(Error::InvalidRevision(input.to_owned()));
        }

        Ok(Self::BranchTag(input.to_owned()))
    }

    pub fn resolve(&self, repo: &Repo) -> Result<Option<Digest>> {
        fn branchtag(name: &str, repo: &Repo) -> Result<Option<Digest>> {
            if name.starts_with("refs/") {
                return repo.refs().read(&RefName::new(name)?);
            }
            for candidate in [RefName::branch(name), RefName::tag(name)] {
                let Ok(candidate) = candidate else {
                    continue;
                };
                if let Some(oid) = repo.refs().read(&candidate)? {
                    return Ok(Some(oid));
                }
            }
            Ok(None)
        }

        match self {
            Refname::Head => repo.head(),

            Refname::Full(oid) => {
                if repo.store().contains(oid) {
                    repo.store().get_commit(oid)?;
                    Ok(Some(oid.clone()))
                } else {
                    Ok(None)
                }
            }

            Refname::PartialDigest(prefix) => {
                let candidates = repo.store().find_by_prefix(prefix)?;

                match candidates.as_slice() {
                    // No candidates - treat as a branch / tag name
                    [] => branchtag(prefix, repo),

                    // One candidate - Found it!
                    [oid] => {
                        repo.store().get_commit(oid)?;
                        Ok(Some(oid.clone()))
                    }

                    // Multiple candidates - Ambiguous, tell user to be more specific
                    _ => Err(Error::AmbiguousRevision {
                        prefix: prefix.clone(),
                        candidates,
                    }),
                }
            }

            Refname::BranchTag(name) => branchtag(name, repo),
        }
    }
}
