use byteorder::{ByteOrder, LittleEndian};
use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Name of the synthetic cell-key dimension prepended by [`Schema::celled`].
pub const TUBE_ID_DIM: &str = "TubeId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    #[serde(rename = "int8")]
    Int8,
    #[serde(rename = "int16")]
    Int16,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "double")]
    Double,
}

impl ScalarType {
    pub fn size(self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float => 4,
            ScalarType::Int64 | ScalarType::UInt64 | ScalarType::Double => 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub r#type: ScalarType,
}

impl Dimension {
    pub fn new(name: impl Into<String>, r#type: ScalarType) -> Self {
        Self {
            name: name.into(),
            r#type,
        }
    }

    pub fn size(&self) -> usize {
        self.r#type.size()
    }
}

/// Ordered attribute layout of a point record. Offsets and the point
/// stride are derived once; the serialized form is just the dimension
/// list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Dimension>", into = "Vec<Dimension>")]
pub struct Schema {
    dims: Vec<Dimension>,
    offsets: Vec<usize>,
    point_size: usize,
    position: [Option<usize>; 3],
}

impl Schema {
    pub fn new(dims: Vec<Dimension>) -> Self {
        let mut offsets = Vec::with_capacity(dims.len());
        let mut offset = 0;
        for dim in &dims {
            offsets.push(offset);
            offset += dim.size();
        }

        let find = |name: &str| dims.iter().position(|d| d.name == name);
        let position = [find("X"), find("Y"), find("Z")];

        Self {
            dims,
            offsets,
            point_size: offset,
            position,
        }
    }

    /// Conventional XYZ-double layout with no extra attributes.
    pub fn xyz() -> Self {
        Self::new(vec![
            Dimension::new("X", ScalarType::Double),
            Dimension::new("Y", ScalarType::Double),
            Dimension::new("Z", ScalarType::Double),
        ])
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    pub fn offset(&self, dim: usize) -> usize {
        self.offsets[dim]
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn has_position(&self) -> bool {
        self.position.iter().all(Option::is_some)
    }

    /// The same layout prefixed with an 8-byte `TubeId` cell key, as used
    /// by sparse and base chunk records.
    pub fn celled(&self) -> Schema {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(Dimension::new(TUBE_ID_DIM, ScalarType::UInt64));
        dims.extend(self.dims.iter().cloned());
        Schema::new(dims)
    }

    /// Read dimension `dim` from a point record, widened to f64.
    pub fn read_f64(&self, dim: usize, data: &[u8]) -> f64 {
        let off = self.offsets[dim];
        match self.dims[dim].r#type {
            ScalarType::Int8 => data[off] as i8 as f64,
            ScalarType::UInt8 => data[off] as f64,
            ScalarType::Int16 => LittleEndian::read_i16(&data[off..]) as f64,
            ScalarType::UInt16 => LittleEndian::read_u16(&data[off..]) as f64,
            ScalarType::Int32 => LittleEndian::read_i32(&data[off..]) as f64,
            ScalarType::UInt32 => LittleEndian::read_u32(&data[off..]) as f64,
            ScalarType::Int64 => LittleEndian::read_i64(&data[off..]) as f64,
            ScalarType::UInt64 => LittleEndian::read_u64(&data[off..]) as f64,
            ScalarType::Float => LittleEndian::read_f32(&data[off..]) as f64,
            ScalarType::Double => LittleEndian::read_f64(&data[off..]),
        }
    }

    /// Write dimension `dim` into a point record, narrowing from f64.
    pub fn write_f64(&self, dim: usize, data: &mut [u8], value: f64) {
        let off = self.offsets[dim];
        match self.dims[dim].r#type {
            ScalarType::Int8 => data[off] = value as i8 as u8,
            ScalarType::UInt8 => data[off] = value as u8,
            ScalarType::Int16 => LittleEndian::write_i16(&mut data[off..], value as i16),
            ScalarType::UInt16 => LittleEndian::write_u16(&mut data[off..], value as u16),
            ScalarType::Int32 => LittleEndian::write_i32(&mut data[off..], value as i32),
            ScalarType::UInt32 => LittleEndian::write_u32(&mut data[off..], value as u32),
            ScalarType::Int64 => LittleEndian::write_i64(&mut data[off..], value as i64),
            ScalarType::UInt64 => LittleEndian::write_u64(&mut data[off..], value as u64),
            ScalarType::Float => LittleEndian::write_f32(&mut data[off..], value as f32),
            ScalarType::Double => LittleEndian::write_f64(&mut data[off..], value),
        }
    }

    /// XYZ coordinates of a point record; missing dimensions read as zero.
    pub fn position(&self, data: &[u8]) -> DVec3 {
        let read = |slot: Option<usize>| slot.map(|dim| self.read_f64(dim, data)).unwrap_or(0.0);
        DVec3::new(
            read(self.position[0]),
            read(self.position[1]),
            read(self.position[2]),
        )
    }

    pub fn set_position(&self, data: &mut [u8], p: DVec3) {
        if let Some(dim) = self.position[0] {
            self.write_f64(dim, data, p.x);
        }
        if let Some(dim) = self.position[1] {
            self.write_f64(dim, data, p.y);
        }
        if let Some(dim) = self.position[2] {
            self.write_f64(dim, data, p.z);
        }
    }

    /// Serialize a point's coordinates under this schema.
    pub fn pack_position(&self, p: DVec3) -> Vec<u8> {
        let mut data = vec![0u8; self.point_size];
        self.set_position(&mut data, p);
        data
    }
}

impl From<Vec<Dimension>> for Schema {
    fn from(dims: Vec<Dimension>) -> Self {
        Schema::new(dims)
    }
}

impl From<Schema> for Vec<Dimension> {
    fn from(schema: Schema) -> Self {
        schema.dims
    }
}
