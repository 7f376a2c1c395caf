//! Sensor observation trees.
//!
//! Observations are heterogeneous per experiment: a flat set of sensors, or
//! sensors nested under preprocessor groups. They are represented as a
//! tagged tree of tensors keyed by [`SensorPath`] so that flattening for
//! storage and exact reconstruction for model consumption are total
//! functions of the structure, with no reserved-separator string tricks.
use crate::error::ConfigError;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use tch::{Device, Tensor};

/// Path of a sensor within a nested observation schema.
///
/// A single component names a top-level sensor; additional components name
/// the groups it is nested under, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SensorPath(SmallVec<[String; 2]>);

impl SensorPath {
    /// A top-level sensor name.
    pub fn leaf(name: impl Into<String>) -> Self {
        let mut components = SmallVec::new();
        components.push(name.into());
        Self(components)
    }

    /// A sensor nested under one or more groups, outermost component first.
    ///
    /// # Panics
    /// If `components` is empty.
    pub fn nested<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: SmallVec<[String; 2]> =
            components.into_iter().map(Into::into).collect();
        assert!(!components.is_empty(), "sensor path must not be empty");
        Self(components)
    }

    /// The path components, outermost first.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Whether this sensor is nested below the top level.
    pub fn is_nested(&self) -> bool {
        self.0.len() > 1
    }

    fn child(&self, name: &str) -> Self {
        let mut components = self.0.clone();
        components.push(name.to_owned());
        Self(components)
    }
}

impl fmt::Display for SensorPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A nested observation structure with tensor leaves.
#[derive(Debug)]
pub enum ObservationTree {
    Leaf(Tensor),
    Node(BTreeMap<String, ObservationTree>),
}

impl Default for ObservationTree {
    fn default() -> Self {
        Self::Node(BTreeMap::new())
    }
}

impl ObservationTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from flattened `(path, tensor)` entries.
    ///
    /// # Errors
    /// [`ConfigError::ConflictingSensorPath`] if one entry's path passes
    /// through another entry's leaf, or two entries share a path.
    pub fn from_flattened<I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (SensorPath, Tensor)>,
    {
        let mut tree = Self::new();
        for (path, tensor) in entries {
            tree.set(&path, tensor)?;
        }
        Ok(tree)
    }

    /// Insert a leaf tensor at the given path, creating intermediate nodes.
    ///
    /// # Errors
    /// [`ConfigError::ConflictingSensorPath`] if the path passes through an
    /// existing leaf or ends on an existing entry.
    pub fn set(&mut self, path: &SensorPath, tensor: Tensor) -> Result<(), ConfigError> {
        let conflict = || ConfigError::ConflictingSensorPath {
            path: path.to_string(),
        };

        let mut node = self;
        let (last, inner) = path.components().split_last().expect("path is non-empty");
        for component in inner {
            let children = match node {
                Self::Node(children) => children,
                Self::Leaf(_) => return Err(conflict()),
            };
            node = children
                .entry(component.clone())
                .or_insert_with(Self::default);
        }
        match node {
            Self::Node(children) => {
                if children.insert(last.clone(), Self::Leaf(tensor)).is_some() {
                    return Err(conflict());
                }
            }
            Self::Leaf(_) => return Err(conflict()),
        }
        Ok(())
    }

    /// The leaf tensor at the given path, if any.
    pub fn get(&self, path: &SensorPath) -> Option<&Tensor> {
        let mut node = self;
        let (last, inner) = path.components().split_last()?;
        for component in inner {
            match node {
                Self::Node(children) => node = children.get(component)?,
                Self::Leaf(_) => return None,
            }
        }
        match node {
            Self::Node(children) => match children.get(last)? {
                Self::Leaf(tensor) => Some(tensor),
                Self::Node(_) => None,
            },
            Self::Leaf(_) => None,
        }
    }

    /// All leaves paired with their paths, in path order.
    pub fn flattened(&self) -> Vec<(SensorPath, &Tensor)> {
        let mut out = Vec::new();
        self.collect_leaves(None, &mut out);
        out
    }

    fn collect_leaves<'a>(
        &'a self,
        prefix: Option<&SensorPath>,
        out: &mut Vec<(SensorPath, &'a Tensor)>,
    ) {
        match self {
            Self::Leaf(tensor) => {
                // A bare leaf at the root has no name; it cannot occur via
                // the public constructors.
                let path = prefix.cloned().unwrap_or_default();
                out.push((path, tensor));
            }
            Self::Node(children) => {
                for (name, child) in children {
                    let path = match prefix {
                        Some(prefix) => prefix.child(name),
                        None => SensorPath::leaf(name.clone()),
                    };
                    match child {
                        Self::Leaf(tensor) => out.push((path, tensor)),
                        Self::Node(_) => child.collect_leaves(Some(&path), out),
                    }
                }
            }
        }
    }

    /// Number of leaf tensors.
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Node(children) => children.values().map(Self::num_leaves).sum(),
        }
    }

    /// Whether the tree holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.num_leaves() == 0
    }

    /// A copy of the tree with every leaf moved to the given device.
    pub fn to_device(&self, device: Device) -> Self {
        match self {
            Self::Leaf(tensor) => Self::Leaf(tensor.to_device(device)),
            Self::Node(children) => Self::Node(
                children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.to_device(device)))
                    .collect(),
            ),
        }
    }
}

/// Stack per-worker observation trees along a new leading process axis.
///
/// Every tree must have the same schema; leaves of shape `[..]` become
/// leaves of shape `[num_workers, ..]` on `device`.
///
/// # Errors
/// [`ConfigError::ObservationSchemaMismatch`] if the trees disagree on
/// structure.
pub fn batch_observations(
    observations: &[&ObservationTree],
    device: Device,
) -> Result<ObservationTree, ConfigError> {
    let first = observations
        .first()
        .expect("at least one observation is required");
    let schema = first.flattened();

    let mut batched = Vec::with_capacity(schema.len());
    for (path, _) in &schema {
        let mut leaves = Vec::with_capacity(observations.len());
        for tree in observations {
            let leaf =
                tree.get(path)
                    .ok_or_else(|| ConfigError::ObservationSchemaMismatch {
                        path: path.to_string(),
                    })?;
            leaves.push(leaf);
        }
        batched.push((path.clone(), Tensor::stack(&leaves, 0).to_device(device)));
    }

    // A tree with extra sensors would pass the lookups above.
    for tree in observations {
        if tree.num_leaves() != schema.len() {
            return Err(ConfigError::ObservationSchemaMismatch {
                path: String::from("<root>"),
            });
        }
    }

    ObservationTree::from_flattened(batched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn leaf(value: f32, shape: &[i64]) -> Tensor {
        Tensor::full(shape, f64::from(value), (Kind::Float, Device::Cpu))
    }

    fn nav_observation() -> ObservationTree {
        ObservationTree::from_flattened(vec![
            (SensorPath::leaf("rgb"), leaf(0.5, &[4, 4, 3])),
            (
                SensorPath::nested(["target", "coordinates"]),
                leaf(1.0, &[3]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn flatten_round_trip() {
        let tree = nav_observation();
        let flattened: Vec<_> = tree
            .flattened()
            .into_iter()
            .map(|(path, tensor)| (path, tensor.shallow_clone()))
            .collect();
        assert_eq!(flattened.len(), 2);
        assert_eq!(flattened[0].0, SensorPath::leaf("rgb"));
        assert_eq!(
            flattened[1].0,
            SensorPath::nested(["target", "coordinates"])
        );

        let rebuilt = ObservationTree::from_flattened(flattened).unwrap();
        assert_eq!(rebuilt.num_leaves(), 2);
        assert_eq!(
            rebuilt
                .get(&SensorPath::nested(["target", "coordinates"]))
                .unwrap()
                .size(),
            vec![3],
        );
    }

    #[test]
    fn get_missing_is_none() {
        let tree = nav_observation();
        assert!(tree.get(&SensorPath::leaf("depth")).is_none());
        assert!(tree.get(&SensorPath::nested(["target", "angle"])).is_none());
        // A prefix of a nested path is a node, not a leaf.
        assert!(tree.get(&SensorPath::leaf("target")).is_none());
    }

    #[test]
    fn conflicting_paths_rejected() {
        let result = ObservationTree::from_flattened(vec![
            (SensorPath::leaf("target"), leaf(0.0, &[1])),
            (SensorPath::nested(["target", "coordinates"]), leaf(0.0, &[3])),
        ]);
        assert!(matches!(
            result,
            Err(ConfigError::ConflictingSensorPath { .. })
        ));
    }

    #[test]
    fn duplicate_path_rejected() {
        let result = ObservationTree::from_flattened(vec![
            (SensorPath::leaf("rgb"), leaf(0.0, &[2])),
            (SensorPath::leaf("rgb"), leaf(1.0, &[2])),
        ]);
        assert!(matches!(
            result,
            Err(ConfigError::ConflictingSensorPath { .. })
        ));
    }

    #[test]
    fn batch_stacks_leaves() {
        let a = nav_observation();
        let b = nav_observation();
        let batched = batch_observations(&[&a, &b], Device::Cpu).unwrap();
        assert_eq!(
            batched.get(&SensorPath::leaf("rgb")).unwrap().size(),
            vec![2, 4, 4, 3],
        );
        assert_eq!(
            batched
                .get(&SensorPath::nested(["target", "coordinates"]))
                .unwrap()
                .size(),
            vec![2, 3],
        );
    }

    #[test]
    fn batch_schema_mismatch() {
        let a = nav_observation();
        let b = ObservationTree::from_flattened(vec![(
            SensorPath::leaf("rgb"),
            leaf(0.0, &[4, 4, 3]),
        )])
        .unwrap();
        assert!(matches!(
            batch_observations(&[&a, &b], Device::Cpu),
            Err(ConfigError::ObservationSchemaMismatch { .. })
        ));
    }
}
