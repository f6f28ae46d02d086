use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::attestation::Attestation;
use crate::crypto;
use crate::error::LuckError;

/// Text and nonce form of the root sentinel.
pub const GENESIS: &str = "GENESIS";

/// SHA-256 digest of an object's canonical bincode encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, LuckError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| LuckError::Serialization(format!("bad content hash {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// A reference to a stored object, or the genesis sentinel that stands in for
/// the root block, its payload, and its hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    Genesis,
    Content(ContentHash),
}

#[derive(Serialize, Deserialize)]
enum ObjectRefRepr {
    Genesis,
    Content(ContentHash),
}

impl ObjectRef {
    #[must_use]
    pub const fn is_genesis(&self) -> bool {
        matches!(self, Self::Genesis)
    }

    #[must_use]
    pub const fn content(&self) -> Option<ContentHash> {
        match self {
            Self::Genesis => None,
            Self::Content(hash) => Some(*hash),
        }
    }

    /// Bytes embedded in a nonce: the ASCII sentinel or the raw digest.
    #[must_use]
    pub fn to_nonce_bytes(&self) -> Vec<u8> {
        match self {
            Self::Genesis => GENESIS.as_bytes().to_vec(),
            Self::Content(hash) => hash.0.to_vec(),
        }
    }

    pub fn from_nonce_bytes(bytes: &[u8]) -> Result<Self, LuckError> {
        if bytes == GENESIS.as_bytes() {
            return Ok(Self::Genesis);
        }
        let digest: [u8; 32] = bytes.try_into().map_err(|_| {
            LuckError::MalformedNonce(format!("hash of {} bytes is not a digest", bytes.len()))
        })?;
        Ok(Self::Content(ContentHash(digest)))
    }
}

impl From<ContentHash> for ObjectRef {
    fn from(hash: ContentHash) -> Self {
        Self::Content(hash)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Genesis => f.write_str(GENESIS),
            Self::Content(hash) => fmt::Display::fmt(hash, f),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Genesis => f.write_str(GENESIS),
            Self::Content(hash) => fmt::Debug::fmt(hash, f),
        }
    }
}

impl FromStr for ObjectRef {
    type Err = LuckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GENESIS {
            Ok(Self::Genesis)
        } else {
            ContentHash::from_hex(s).map(Self::Content)
        }
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            match self {
                Self::Genesis => ObjectRefRepr::Genesis,
                Self::Content(hash) => ObjectRefRepr::Content(*hash),
            }
            .serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            Ok(match ObjectRefRepr::deserialize(deserializer)? {
                ObjectRefRepr::Genesis => Self::Genesis,
                ObjectRefRepr::Content(hash) => Self::Content(hash),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkName {
    Parent,
    Transaction,
    Payload,
}

/// A named edge from one stored object to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: LinkName,
    pub hash: ObjectRef,
}

impl Link {
    #[must_use]
    pub const fn parent(hash: ObjectRef) -> Self {
        Self {
            name: LinkName::Parent,
            hash,
        }
    }

    #[must_use]
    pub const fn transaction(hash: ContentHash) -> Self {
        Self {
            name: LinkName::Transaction,
            hash: ObjectRef::Content(hash),
        }
    }
}

/// An opaque transaction. Payloads reference transactions by content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub data: Vec<u8>,
}

#[derive(Deserialize)]
struct PayloadLinks {
    links: Vec<Link>,
}

/// The body of a block: pending transactions plus the parent it extends.
///
/// Always holds exactly one `parent` link; other links are content `transaction`s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PayloadLinks")]
pub struct Payload {
    links: Vec<Link>,
}

impl TryFrom<PayloadLinks> for Payload {
    type Error = LuckError;

    fn try_from(raw: PayloadLinks) -> Result<Self, Self::Error> {
        Self::from_links(raw.links)
    }
}

impl Payload {
    /// Build a payload from transaction links followed by the parent link.
    pub fn new(parent: ObjectRef, transactions: impl IntoIterator<Item = ContentHash>) -> Self {
        let mut links: Vec<Link> = transactions.into_iter().map(Link::transaction).collect();
        links.push(Link::parent(parent));
        Self { links }
    }

    pub fn from_links(links: Vec<Link>) -> Result<Self, LuckError> {
        let mut parents = 0;
        for link in &links {
            match link.name {
                LinkName::Parent => parents += 1,
                LinkName::Transaction if link.hash.is_genesis() => {
                    return Err(LuckError::InvalidPayload(
                        "transaction link cannot reference genesis".into(),
                    ));
                }
                LinkName::Transaction => {}
                LinkName::Payload => {
                    return Err(LuckError::InvalidPayload(
                        "payload link is not allowed in a payload".into(),
                    ));
                }
            }
        }
        if parents != 1 {
            return Err(LuckError::InvalidPayload(format!(
                "expected exactly one parent link, found {parents}"
            )));
        }
        Ok(Self { links })
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    #[must_use]
    pub fn parent(&self) -> ObjectRef {
        self.links
            .iter()
            .find(|l| l.name == LinkName::Parent)
            .map(|l| l.hash)
            .expect("payload always carries one parent link")
    }

    pub fn transactions(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.links
            .iter()
            .filter(|l| l.name == LinkName::Transaction)
            .filter_map(|l| l.hash.content())
    }

    /// Only the parent link is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.len() == 1
    }
}

#[derive(Deserialize)]
struct BlockFields {
    luck: f64,
    attestation: Attestation,
    links: Vec<Link>,
}

/// A mined block: the attested luck and a single link to its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BlockFields")]
pub struct Block {
    luck: f64,
    attestation: Attestation,
    links: Vec<Link>,
}

impl TryFrom<BlockFields> for Block {
    type Error = LuckError;

    fn try_from(raw: BlockFields) -> Result<Self, Self::Error> {
        Self::from_parts(raw.luck, raw.attestation, raw.links)
    }
}

impl Block {
    #[must_use]
    pub fn new(luck: f64, attestation: Attestation, payload: ContentHash) -> Self {
        Self {
            luck,
            attestation,
            links: vec![Link {
                name: LinkName::Payload,
                hash: ObjectRef::Content(payload),
            }],
        }
    }

    pub fn from_parts(
        luck: f64,
        attestation: Attestation,
        links: Vec<Link>,
    ) -> Result<Self, LuckError> {
        match links.as_slice() {
            [
                Link {
                    name: LinkName::Payload,
                    hash: ObjectRef::Content(_),
                },
            ] => {}
            _ => {
                return Err(LuckError::InvalidBlock(
                    "a block must have exactly one content payload link".into(),
                ));
            }
        }
        if !luck.is_finite() {
            return Err(LuckError::InvalidBlock(format!("luck {luck} is not finite")));
        }
        Ok(Self {
            luck,
            attestation,
            links,
        })
    }

    #[must_use]
    pub const fn luck(&self) -> f64 {
        self.luck
    }

    #[must_use]
    pub const fn attestation(&self) -> &Attestation {
        &self.attestation
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    #[must_use]
    pub fn payload_hash(&self) -> ContentHash {
        self.links
            .first()
            .and_then(|l| l.hash.content())
            .expect("block always carries one content payload link")
    }
}

/// The block a new payload is mined against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PriorBlock {
    Genesis,
    Block(Block),
}

impl PriorBlock {
    pub fn object_ref(&self) -> Result<ObjectRef, LuckError> {
        match self {
            Self::Genesis => Ok(ObjectRef::Genesis),
            Self::Block(block) => crypto::content_hash(block).map(ObjectRef::Content),
        }
    }

    #[must_use]
    pub fn payload_ref(&self) -> ObjectRef {
        match self {
            Self::Genesis => ObjectRef::Genesis,
            Self::Block(block) => ObjectRef::Content(block.payload_hash()),
        }
    }
}

/// The payload of the chain head a round races against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PriorPayload {
    Genesis,
    Payload(Payload),
}

impl PriorPayload {
    pub fn object_ref(&self) -> Result<ObjectRef, LuckError> {
        match self {
            Self::Genesis => Ok(ObjectRef::Genesis),
            Self::Payload(payload) => crypto::content_hash(payload).map(ObjectRef::Content),
        }
    }

    /// The block this payload extends; genesis has none.
    #[must_use]
    pub fn lineage(&self) -> Option<ObjectRef> {
        match self {
            Self::Genesis => None,
            Self::Payload(payload) => Some(payload.parent()),
        }
    }
}

/// One entry of a reconstructed chain, oldest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub luck: f64,
    pub attestation: Option<Attestation>,
    pub hash: ObjectRef,
    pub payload_hash: ObjectRef,
    pub parent_hash: ObjectRef,
    pub transactions: Vec<ContentHash>,
}

impl ChainBlock {
    #[must_use]
    pub const fn genesis() -> Self {
        Self {
            luck: -1.0,
            attestation: None,
            hash: ObjectRef::Genesis,
            payload_hash: ObjectRef::Genesis,
            parent_hash: ObjectRef::Genesis,
            transactions: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_genesis(&self) -> bool {
        self.hash.is_genesis()
    }
}
