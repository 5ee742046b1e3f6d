use std::path::PathBuf;

use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;
use crate::crypto::InfoHash;

const SHA1_LEN: usize = 20;

// https://wiki.theory.org/BitTorrentSpecification#Metainfo_File_Structure

/// Parsed descriptor (`.torrent` metainfo).
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub total_pieces: usize,
    pub files: Vec<File>,
    pub trackers: Vec<String>,
    /// The raw info dictionary, kept so it can be embedded in resume data.
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
}

impl Metainfo {
    /// Builds metainfo from a bare info dictionary, as found in resume data.
    pub fn from_info(info: Value, trackers: Vec<String>) -> Result<Self> {
        let info_hash = InfoHash::from(&info);
        let mut fields = info.clone();
        let name: String = fields.remove_entry("name")?.try_into()?;
        let piece_length = fields.remove_entry("piece length")?.try_into()?;
        let pieces: Vec<u8> = fields.remove_entry("pieces")?.try_into()?;
        if pieces.len() % SHA1_LEN != 0 {
            return Err(anyhow!(
                "invalid pieces length {}. must be a multiple of {}",
                pieces.len(),
                SHA1_LEN
            ));
        }
        let files = build_files(&name, fields)?;
        files
            .iter()
            .try_fold(0u64, |total, file| total.checked_add(file.length))
            .ok_or_else(|| anyhow!("total length of '{}' overflows", name))?;
        Ok(Self {
            info_hash,
            name,
            piece_length,
            total_pieces: pieces.len() / SHA1_LEN,
            files,
            trackers,
            info,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.files
            .iter()
            .fold(0, |total, file| total.saturating_add(file.length))
    }
}

impl TryFrom<Value> for Metainfo {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        let mut trackers = Vec::new();
        if let Some(announce) = value.try_remove_entry("announce") {
            trackers.push(String::try_from(announce)?);
        }
        if let Some(tiers) = value.try_remove_entry("announce-list") {
            for tier in Vec::<Value>::try_from(tiers)? {
                for tracker in Vec::<Value>::try_from(tier)? {
                    let tracker = String::try_from(tracker)?;
                    if !trackers.contains(&tracker) {
                        trackers.push(tracker);
                    }
                }
            }
        }
        let info = value.remove_entry("info")?;
        Self::from_info(info, trackers)
    }
}

fn build_files(name: &str, mut info: Value) -> Result<Vec<File>> {
    if let Some(length) = info.try_remove_entry("length") {
        return Ok(vec![File {
            path: PathBuf::from(name),
            length: length.try_into()?,
        }]);
    }

    if let Some(files) = info.try_remove_entry("files") {
        let files: Vec<Value> = files.try_into()?;
        let mut result = Vec::with_capacity(files.len());
        for mut file in files {
            let length = file.remove_entry("length")?.try_into()?;
            let parts: Vec<Value> = file.remove_entry("path")?.try_into()?;
            let mut path = PathBuf::from(name);
            for part in parts {
                let part: String = part.try_into()?;
                path.push(part);
            }
            result.push(File { path, length });
        }
        return Ok(result);
    }

    Err(anyhow!("invalid metainfo: neither 'length' nor 'files' present"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A single-file descriptor with one tracker, bencoded.
    pub(crate) fn descriptor_bytes(name: &str, length: i64) -> Vec<u8> {
        Value::dictionary()
            .with_entry(
                "announce",
                Value::string("udp://tracker.opentrackr.org:1337/announce"),
            )
            .with_entry(
                "info",
                Value::dictionary()
                    .with_entry("piece length", Value::Integer(16384))
                    .with_entry("pieces", Value::String(vec![1; 40]))
                    .with_entry("name", Value::string(name))
                    .with_entry("length", Value::Integer(length)),
            )
            .to_bytes()
    }

    pub(crate) fn metainfo(name: &str, length: i64) -> Metainfo {
        Metainfo::try_from(Value::decode(&descriptor_bytes(name, length)).unwrap()).unwrap()
    }

    #[test]
    fn valid_torrent_metainfo() {
        let value = Value::decode(&descriptor_bytes("image.iso", 5678)).unwrap();
        let info_hash = InfoHash::from(value.get("info").unwrap());

        let metainfo = Metainfo::try_from(value).expect("invalid metainfo");

        assert_eq!(metainfo.info_hash, info_hash);
        assert_eq!(metainfo.name, "image.iso");
        assert_eq!(metainfo.piece_length, 16384);
        assert_eq!(metainfo.total_pieces, 2);
        assert_eq!(metainfo.total_length(), 5678);
        assert_eq!(
            metainfo.trackers,
            vec!["udp://tracker.opentrackr.org:1337/announce".to_string()]
        );
    }

    #[test]
    fn multi_file_torrent_metainfo() {
        let metainfo = Value::dictionary()
            .with_entry(
                "announce-list",
                Value::list()
                    .with_value(Value::list().with_value(Value::string("http://a/announce")))
                    .with_value(
                        Value::list()
                            .with_value(Value::string("http://b/announce"))
                            .with_value(Value::string("http://a/announce")),
                    ),
            )
            .with_entry(
                "info",
                Value::dictionary()
                    .with_entry("piece length", Value::Integer(46))
                    .with_entry("pieces", Value::string(""))
                    .with_entry("name", Value::string("root"))
                    .with_entry(
                        "files",
                        Value::list()
                            .with_value(
                                Value::dictionary()
                                    .with_entry("length", Value::Integer(12))
                                    .with_entry(
                                        "path",
                                        Value::list()
                                            .with_value(Value::string("dir"))
                                            .with_value(Value::string("file1")),
                                    ),
                            )
                            .with_value(
                                Value::dictionary()
                                    .with_entry("length", Value::Integer(34))
                                    .with_entry(
                                        "path",
                                        Value::list().with_value(Value::string("file2")),
                                    ),
                            ),
                    ),
            );

        let metainfo = Metainfo::try_from(metainfo).expect("invalid metainfo");

        assert_eq!(metainfo.files.len(), 2);
        assert_eq!(metainfo.files[0].path, PathBuf::from("root/dir/file1"));
        assert_eq!(metainfo.files[1].path, PathBuf::from("root/file2"));
        assert_eq!(metainfo.total_length(), 46);
        assert_eq!(
            metainfo.trackers,
            vec!["http://a/announce".to_string(), "http://b/announce".to_string()]
        );
    }

    #[test]
    fn missing_info() {
        let value = Value::dictionary().with_entry("announce", Value::string("http://a"));

        assert!(Metainfo::try_from(value).is_err());
    }

    #[test]
    fn invalid_pieces_length() {
        let info = Value::dictionary()
            .with_entry("piece length", Value::Integer(1))
            .with_entry("pieces", Value::String(vec![0; 7]))
            .with_entry("name", Value::string("x"))
            .with_entry("length", Value::Integer(1));

        assert!(Metainfo::from_info(info, Vec::new()).is_err());
    }

    /// An info dict whose file lengths add up past `u64::MAX`.
    pub(crate) fn overflowing_info() -> Value {
        let file = Value::dictionary()
            .with_entry("length", Value::Integer(i64::MAX))
            .with_entry("path", Value::list().with_value(Value::string("huge")));
        Value::dictionary()
            .with_entry("piece length", Value::Integer(16384))
            .with_entry("pieces", Value::String(vec![0; 20]))
            .with_entry("name", Value::string("root"))
            .with_entry(
                "files",
                Value::list()
                    .with_value(file.clone())
                    .with_value(file.clone())
                    .with_value(file),
            )
    }

    #[test]
    fn overflowing_total_length() {
        let err = Metainfo::from_info(overflowing_info(), Vec::new()).unwrap_err();

        assert!(err.to_string().contains("overflows"));
    }
}
