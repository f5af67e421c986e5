//! Object Dictionary for the mock CANopen node
//!
//! Entries are addressed by `(index, subindex)`. Lookups fail with the SDO
//! abort code the server sends back, so the server never has to translate.

use canopen_client::sdo::abort::{
    ABORT_ATTEMPT_TO_READ_WRITE_ONLY, ABORT_ATTEMPT_TO_WRITE_READ_ONLY, ABORT_DATA_TYPE_DOES_NOT_MATCH,
    ABORT_OBJECT_DOES_NOT_EXIST, ABORT_SUB_INDEX_DOES_NOT_EXIST,
};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("Object dictionary I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse object dictionary: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Value of 0x{index:04X}:{subindex:02X} does not fit {data_type:?}")]
    InvalidValue {
        index: u16,
        subindex: u8,
        data_type: DataType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    Int8,
    Int16,
    Int32,
    Real32,
    #[serde(rename = "visible_string")]
    VisibleString,
    Domain,
}

impl DataType {
    /// Encoded size of fixed-width types, `None` for strings and domains
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::UInt8 | Self::Int8 => Some(1),
            Self::UInt16 | Self::Int16 => Some(2),
            Self::UInt32 | Self::Int32 | Self::Real32 => Some(4),
            Self::VisibleString | Self::Domain => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Access {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "wo")]
    WriteOnly,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Access {
    fn readable(self) -> bool {
        self != Self::WriteOnly
    }

    fn writable(self) -> bool {
        self != Self::ReadOnly
    }
}

/// Represents a single entry in the object dictionary
pub enum ObjectEntry {
    /// Stored value, written back by SDO downloads when the access allows it
    Static {
        data: Vec<u8>,
        data_type: DataType,
        access: Access,
    },
    /// Read-only value generated on each read
    Dynamic {
        generator: Box<dyn Fn() -> Vec<u8> + Send + Sync>,
        data_type: DataType,
    },
}

impl ObjectEntry {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Static { data_type, .. } | Self::Dynamic { data_type, .. } => *data_type,
        }
    }
}

/// Object dictionary mapping (index, subindex) to values
#[derive(Default)]
pub struct ObjectDictionary {
    entries: HashMap<(u16, u8), ObjectEntry>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_static(&mut self, index: u16, subindex: u8, data: Vec<u8>, data_type: DataType, access: Access) {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Static {
                data,
                data_type,
                access,
            },
        );
    }

    /// Add a dynamic entry (value generated on each read)
    pub fn add_dynamic<F>(&mut self, index: u16, subindex: u8, generator: F, data_type: DataType)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Dynamic {
                generator: Box::new(generator),
                data_type,
            },
        );
    }

    /// Current value of an entry, or the abort code for the request
    pub fn get(&self, index: u16, subindex: u8) -> Result<Vec<u8>, u32> {
        match self.entry(index, subindex)? {
            ObjectEntry::Static { access, .. } if !access.readable() => Err(ABORT_ATTEMPT_TO_READ_WRITE_ONLY),
            ObjectEntry::Static { data, .. } => Ok(data.clone()),
            ObjectEntry::Dynamic { generator, .. } => Ok(generator()),
        }
    }

    /// Whether a download to the entry may start at all
    pub fn check_writable(&self, index: u16, subindex: u8) -> Result<(), u32> {
        match self.entry(index, subindex)? {
            ObjectEntry::Static { access, .. } if access.writable() => Ok(()),
            _ => Err(ABORT_ATTEMPT_TO_WRITE_READ_ONLY),
        }
    }

    /// Store a downloaded value. Fixed-width types must receive exactly their size.
    pub fn set(&mut self, index: u16, subindex: u8, value: Vec<u8>) -> Result<(), u32> {
        self.check_writable(index, subindex)?;

        let Some(ObjectEntry::Static { data, data_type, .. }) = self.entries.get_mut(&(index, subindex)) else {
            return Err(ABORT_OBJECT_DOES_NOT_EXIST);
        };
        if data_type.fixed_size().is_some_and(|size| size != value.len()) {
            return Err(ABORT_DATA_TYPE_DOES_NOT_MATCH);
        }
        *data = value;
        Ok(())
    }

    fn entry(&self, index: u16, subindex: u8) -> Result<&ObjectEntry, u32> {
        if let Some(entry) = self.entries.get(&(index, subindex)) {
            return Ok(entry);
        }
        if self.entries.keys().any(|(i, _)| *i == index) {
            Err(ABORT_SUB_INDEX_DOES_NOT_EXIST)
        } else {
            Err(ABORT_OBJECT_DOES_NOT_EXIST)
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per entry, sorted by address
    pub fn summary(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort_unstable();

        keys.into_iter()
            .filter_map(|(index, subindex)| {
                let entry = self.entries.get(&(index, subindex))?;
                let kind = match entry {
                    ObjectEntry::Static { access, .. } => format!("Static {:?}", access),
                    ObjectEntry::Dynamic { .. } => "Dynamic".to_string(),
                };
                Some(format!("0x{:04X}:{:02X} - {} {:?}", index, subindex, kind, entry.data_type()))
            })
            .collect()
    }

    /// Add standard test objects for demonstration
    pub fn add_test_objects_for_node(&mut self, node_id: u8) {
        // 0x1000:00 - Device Type
        self.add_static(0x1000, 0x00, 0x0000_0191u32.to_le_bytes().to_vec(), DataType::UInt32, Access::ReadOnly);

        // 0x1001:00 - Error Register
        self.add_static(0x1001, 0x00, vec![0x00], DataType::UInt8, Access::ReadOnly);

        // 0x1008:00 - Device Name, long enough for a segmented upload
        let device_name = format!("Mock CANopen Node {}", node_id);
        self.add_static(0x1008, 0x00, device_name.into_bytes(), DataType::VisibleString, Access::ReadOnly);

        // 0x1009:00 - Hardware Version
        self.add_static(0x1009, 0x00, b"1.0".to_vec(), DataType::VisibleString, Access::ReadOnly);

        // 0x1017:00 - Producer heartbeat time (ms)
        self.add_static(0x1017, 0x00, 1000u16.to_le_bytes().to_vec(), DataType::UInt16, Access::ReadWrite);

        // 0x1018:01 - Vendor ID
        self.add_static(0x1018, 0x01, 0x0000_0001u32.to_le_bytes().to_vec(), DataType::UInt32, Access::ReadOnly);

        // 0x1F50:01 - Program data, target of block downloads
        self.add_static(0x1F50, 0x01, Vec::new(), DataType::Domain, Access::WriteOnly);

        // 0x2000:01/02 - Temperature and pressure sensors
        self.add_dynamic(
            0x2000,
            0x01,
            || rand::rng().random_range(20.0f32..30.0).to_le_bytes().to_vec(),
            DataType::Real32,
        );
        self.add_dynamic(
            0x2000,
            0x02,
            || rand::rng().random_range(95.0f32..105.0).to_le_bytes().to_vec(),
            DataType::Real32,
        );

        // 0x2001:01 - Counter, incremented on every read
        let counter = AtomicU32::new(0);
        self.add_dynamic(
            0x2001,
            0x01,
            move || counter.fetch_add(1, Ordering::SeqCst).to_le_bytes().to_vec(),
            DataType::UInt32,
        );

        // 0x2002:01/02 - Voltage and current
        self.add_dynamic(
            0x2002,
            0x01,
            || rand::rng().random_range(11.5f32..12.5).to_le_bytes().to_vec(),
            DataType::Real32,
        );
        self.add_dynamic(
            0x2002,
            0x02,
            || rand::rng().random_range(0.5f32..5.0).to_le_bytes().to_vec(),
            DataType::Real32,
        );

        // 0x2003:01/02 - Status and control word
        self.add_static(0x2003, 0x01, 0x0031u16.to_le_bytes().to_vec(), DataType::UInt16, Access::ReadOnly);
        self.add_static(0x2003, 0x02, 0x000Fu16.to_le_bytes().to_vec(), DataType::UInt16, Access::ReadWrite);

        // 0x2004:01 - RPM
        self.add_dynamic(
            0x2004,
            0x01,
            || rand::rng().random_range(1000i32..3000).to_le_bytes().to_vec(),
            DataType::Int32,
        );

        // 0x2005:01 - Position, advancing by 10 per read
        let position = AtomicU32::new(0);
        self.add_dynamic(
            0x2005,
            0x01,
            move || (position.fetch_add(10, Ordering::SeqCst) as i32).to_le_bytes().to_vec(),
            DataType::Int32,
        );

        // 0x2100:00 - Free-form text, writable by segmented downloads
        self.add_static(0x2100, 0x00, b"hello".to_vec(), DataType::VisibleString, Access::ReadWrite);
    }

    /// Add the static entries of a TOML file.
    ///
    /// ```toml
    /// [[object]]
    /// index = 0x2200
    /// subindex = 1
    /// type = "uint16"
    /// access = "rw"
    /// value = 500
    /// ```
    pub fn load_toml(&mut self, path: &Path) -> Result<usize, DictionaryError> {
        let contents = fs::read_to_string(path)?;
        self.load_toml_str(&contents)
    }

    pub fn load_toml_str(&mut self, contents: &str) -> Result<usize, DictionaryError> {
        let file: DictionaryFile = toml::from_str(contents)?;
        let count = file.object.len();

        for object in file.object {
            let data = object.encode()?;
            self.add_static(object.index, object.subindex, data, object.data_type, object.access);
        }
        Ok(count)
    }
}

#[derive(Debug, Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    object: Vec<ObjectDefinition>,
}

#[derive(Debug, Deserialize)]
struct ObjectDefinition {
    index: u16,
    #[serde(default)]
    subindex: u8,
    #[serde(rename = "type")]
    data_type: DataType,
    #[serde(default)]
    access: Access,
    value: ObjectValue,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ObjectValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ObjectDefinition {
    fn encode(&self) -> Result<Vec<u8>, DictionaryError> {
        let invalid = || DictionaryError::InvalidValue {
            index: self.index,
            subindex: self.subindex,
            data_type: self.data_type,
        };

        let bytes = match (&self.value, self.data_type) {
            (ObjectValue::Integer(v), DataType::Bool) => vec![u8::from(*v != 0)],
            (ObjectValue::Integer(v), DataType::UInt8) => u8::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec(),
            (ObjectValue::Integer(v), DataType::UInt16) => {
                u16::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec()
            }
            (ObjectValue::Integer(v), DataType::UInt32) => {
                u32::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec()
            }
            (ObjectValue::Integer(v), DataType::Int8) => i8::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec(),
            (ObjectValue::Integer(v), DataType::Int16) => {
                i16::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec()
            }
            (ObjectValue::Integer(v), DataType::Int32) => {
                i32::try_from(*v).map_err(|_| invalid())?.to_le_bytes().to_vec()
            }
            (ObjectValue::Integer(v), DataType::Real32) => (*v as f32).to_le_bytes().to_vec(),
            (ObjectValue::Float(v), DataType::Real32) => (*v as f32).to_le_bytes().to_vec(),
            (ObjectValue::Text(s), DataType::VisibleString | DataType::Domain) => s.as_bytes().to_vec(),
            _ => return Err(invalid()),
        };
        Ok(bytes)
    }
}
