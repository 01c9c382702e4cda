//! Point sets with attribute arrays.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    geometry::{BoundingBox, Point},
    types::{DistributeError, Result},
};

/// Values of an attribute array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeData {
    /// Double precision values.
    Float64(Vec<f64>),
    /// Signed integer values, e.g. ids or ranks.
    Int64(Vec<i64>),
    /// Bytes, e.g. marks.
    UInt8(Vec<u8>),
    /// Labels.
    Text(Vec<String>),
}

impl AttributeData {
    /// Number of stored values.
    pub fn len(&self) -> usize {
        match self {
            AttributeData::Float64(values) => values.len(),
            AttributeData::Int64(values) => values.len(),
            AttributeData::UInt8(values) => values.len(),
            AttributeData::Text(values) => values.len(),
        }
    }

    /// Return true if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the value type.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeData::Float64(_) => "Float64",
            AttributeData::Int64(_) => "Int64",
            AttributeData::UInt8(_) => "UInt8",
            AttributeData::Text(_) => "Text",
        }
    }

    fn empty_like(&self, capacity: usize) -> AttributeData {
        match self {
            AttributeData::Float64(_) => AttributeData::Float64(Vec::with_capacity(capacity)),
            AttributeData::Int64(_) => AttributeData::Int64(Vec::with_capacity(capacity)),
            AttributeData::UInt8(_) => AttributeData::UInt8(Vec::with_capacity(capacity)),
            AttributeData::Text(_) => AttributeData::Text(Vec::with_capacity(capacity)),
        }
    }

    fn select(&self, indices: &[usize], components: usize) -> AttributeData {
        fn pick<T: Clone>(values: &[T], indices: &[usize], components: usize) -> Vec<T> {
            let mut selected = Vec::with_capacity(indices.len() * components);
            for &index in indices {
                selected.extend_from_slice(&values[index * components..(index + 1) * components]);
            }
            selected
        }

        match self {
            AttributeData::Float64(values) => {
                AttributeData::Float64(pick(values, indices, components))
            }
            AttributeData::Int64(values) => AttributeData::Int64(pick(values, indices, components)),
            AttributeData::UInt8(values) => AttributeData::UInt8(pick(values, indices, components)),
            AttributeData::Text(values) => AttributeData::Text(pick(values, indices, components)),
        }
    }

    fn extend_from(&mut self, other: &AttributeData) -> Result<()> {
        match (self, other) {
            (AttributeData::Float64(values), AttributeData::Float64(more)) => {
                values.extend_from_slice(more)
            }
            (AttributeData::Int64(values), AttributeData::Int64(more)) => {
                values.extend_from_slice(more)
            }
            (AttributeData::UInt8(values), AttributeData::UInt8(more)) => {
                values.extend_from_slice(more)
            }
            (AttributeData::Text(values), AttributeData::Text(more)) => {
                values.extend_from_slice(more)
            }
            (this, other) => {
                return Err(DistributeError::AttributeMismatch(format!(
                    "cannot append {} values to a {} array",
                    other.type_name(),
                    this.type_name()
                )))
            }
        }
        Ok(())
    }
}

/// A named array with a fixed number of components per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeArray {
    name: String,
    components: usize,
    data: AttributeData,
}

impl AttributeArray {
    /// Create a new attribute array.
    pub fn new(name: &str, components: usize, data: AttributeData) -> Self {
        Self {
            name: name.to_string(),
            components,
            data,
        }
    }

    /// Name of the array.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of components per point.
    pub fn components(&self) -> usize {
        self.components
    }

    /// The values.
    pub fn data(&self) -> &AttributeData {
        &self.data
    }

    /// Number of tuples in the array.
    pub fn tuples(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.data.len() / self.components
        }
    }

    fn same_schema(&self, other: &AttributeArray) -> bool {
        self.name == other.name
            && self.components == other.components
            && self.data.type_name() == other.data.type_name()
    }
}

/// An ordered sequence of points with attribute arrays.
///
/// Every array stores `components * len()` values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointSet {
    points: Vec<Point>,
    arrays: Vec<AttributeArray>,
}

impl PointSet {
    /// Create an empty point set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a point set without attribute arrays.
    pub fn from_points(points: Vec<Point>) -> Self {
        Self {
            points,
            arrays: Vec::new(),
        }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Return true if there are no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The points.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// The attribute arrays.
    pub fn arrays(&self) -> &[AttributeArray] {
        &self.arrays
    }

    /// Find an attribute array by name.
    pub fn array(&self, name: &str) -> Option<&AttributeArray> {
        self.arrays.iter().find(|array| array.name == name)
    }

    /// Add an attribute array.
    ///
    /// Fails if the array length does not match the number of points or if an
    /// array with the same name exists.
    pub fn add_array(&mut self, array: AttributeArray) -> Result<()> {
        if self.array(array.name()).is_some() {
            return Err(DistributeError::InvalidPointSet(format!(
                "array `{}` already exists",
                array.name()
            )));
        }
        check_array_length(&array, self.len())?;
        self.arrays.push(array);
        Ok(())
    }

    /// Add an attribute array, replacing an existing array of the same name.
    pub fn set_array(&mut self, array: AttributeArray) -> Result<()> {
        check_array_length(&array, self.len())?;
        if let Some(existing) = self.arrays.iter_mut().find(|a| a.name == array.name) {
            *existing = array;
        } else {
            self.arrays.push(array);
        }
        Ok(())
    }

    /// Check that every array has as many tuples as there are points.
    pub fn validate(&self) -> Result<()> {
        for array in &self.arrays {
            check_array_length(array, self.len())?;
        }
        if !self.arrays.iter().map(|array| &array.name).all_unique() {
            return Err(DistributeError::InvalidPointSet(
                "duplicate array names".to_string(),
            ));
        }
        Ok(())
    }

    /// Bounding box of the points. The empty box if there are no points.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// A copy of the points without attribute arrays.
    pub fn coordinates_only(&self) -> PointSet {
        PointSet::from_points(self.points.clone())
    }

    /// An empty point set with the same arrays as `self`, with space for `capacity` points.
    pub fn with_capacity_like(&self, capacity: usize) -> PointSet {
        PointSet {
            points: Vec::with_capacity(capacity),
            arrays: self
                .arrays
                .iter()
                .map(|array| AttributeArray {
                    name: array.name.clone(),
                    components: array.components,
                    data: array.data.empty_like(capacity * array.components),
                })
                .collect(),
        }
    }

    /// Extract the points with the given indices together with their attributes.
    pub fn select(&self, indices: &[usize]) -> PointSet {
        PointSet {
            points: indices.iter().map(|&index| self.points[index]).collect(),
            arrays: self
                .arrays
                .iter()
                .map(|array| AttributeArray {
                    name: array.name.clone(),
                    components: array.components,
                    data: array.data.select(indices, array.components),
                })
                .collect(),
        }
    }

    /// Append all points and attributes of `other`.
    ///
    /// An empty point set without arrays adopts the arrays of `other`. Otherwise
    /// both sets must have the same arrays, in any order.
    pub fn append(&mut self, other: &PointSet) -> Result<()> {
        if self.points.is_empty() && self.arrays.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if other.is_empty() && other.arrays.is_empty() {
            return Ok(());
        }

        if self.arrays.len() != other.arrays.len() {
            return Err(DistributeError::AttributeMismatch(format!(
                "{} arrays against {} arrays",
                self.arrays.len(),
                other.arrays.len()
            )));
        }

        // Check all arrays before touching anything so that a failed append
        // leaves the point set unchanged.

        let mut matches = Vec::with_capacity(self.arrays.len());
        for array in &self.arrays {
            match other.arrays.iter().find(|a| a.name == array.name) {
                Some(candidate) if candidate.same_schema(array) => matches.push(candidate),
                _ => {
                    return Err(DistributeError::AttributeMismatch(format!(
                        "array `{}` missing or of different type",
                        array.name
                    )))
                }
            }
        }

        for (array, other_array) in self.arrays.iter_mut().zip(matches) {
            array.data.extend_from(&other_array.data)?;
        }
        self.points.extend_from_slice(&other.points);

        Ok(())
    }

    /// Flatten the point set into a byte buffer.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Rebuild a point set from a buffer created by [PointSet::marshal].
    pub fn unmarshal(bytes: &[u8]) -> Result<PointSet> {
        let point_set: PointSet = bincode::deserialize(bytes)?;
        point_set.validate()?;
        Ok(point_set)
    }
}

fn check_array_length(array: &AttributeArray, npoints: usize) -> Result<()> {
    if array.components == 0 {
        return Err(DistributeError::InvalidPointSet(format!(
            "array `{}` has zero components",
            array.name
        )));
    }
    if array.data.len() != array.components * npoints {
        return Err(DistributeError::InvalidPointSet(format!(
            "array `{}` has {} values, expected {} x {}",
            array.name,
            array.data.len(),
            npoints,
            array.components
        )));
    }
    Ok(())
}
