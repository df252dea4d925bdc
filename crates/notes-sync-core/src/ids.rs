//! Identifiers used throughout the engine: notes, folders, storage directories,
//! and app instances. All are UUIDs; instance ids are minted once per installation
//! and persisted per-SD.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("invalid id format: {0}")]
    InvalidFormat(String),
}

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_simple())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdError::InvalidFormat(s.to_string()))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

uuid_id!(NoteId, "Stable identifier for a single note document.");
uuid_id!(FolderId, "Stable identifier for a folder within a storage directory.");
uuid_id!(SdId, "Stable identifier for a storage directory, persisted in its `SD_ID` file.");
uuid_id!(InstanceId, "Stable identifier for one running app installation, minted once and persisted per-SD.");

/// Identifier for an image blob. Accepts either a UUID or a 32-char hex content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageId {
    Uuid(Uuid),
    ContentHash(String),
}

impl Display for ImageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImageId::Uuid(u) => write!(f, "{}", u.as_simple()),
            ImageId::ContentHash(h) => write!(f, "{h}"),
        }
    }
}

impl FromStr for ImageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(u) = Uuid::parse_str(s) {
            return Ok(ImageId::Uuid(u));
        }
        if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(ImageId::ContentHash(s.to_ascii_lowercase()));
        }
        Err(IdError::InvalidFormat(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_id_roundtrips_through_display_and_parse() {
        let id = NoteId::new();
        let parsed: NoteId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn note_id_display_has_no_hyphens() {
        let id = NoteId::new();
        assert!(!id.to_string().contains('-'));
    }

    #[test]
    fn note_id_parses_hyphenated_form_too() {
        let uuid = Uuid::new_v4();
        let hyphenated = uuid.hyphenated().to_string();
        let parsed: NoteId = hyphenated.parse().unwrap();
        assert_eq!(parsed.as_uuid(), uuid);
    }

    #[test]
    fn image_id_accepts_content_hash() {
        let hash = "a".repeat(32);
        let id: ImageId = hash.parse().unwrap();
        assert_eq!(id, ImageId::ContentHash(hash));
    }

    #[test]
    fn image_id_rejects_garbage() {
        assert!("not-an-id".parse::<ImageId>().is_err());
    }
}
