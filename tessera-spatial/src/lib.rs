//! Spatial features of multiplexed tissue images.
//!
//! - **Cell shapes** — [`Polygon`] with the single-record shapefile codec
//! - **Phenotype signatures** — [`ChannelIndex`] compiles marker criteria into bit masks
//! - **Feature matrices** — [`FeatureMatrix`], one row per cell of a specimen
//! - **Spatial index** — [`SpatialIndex`] over centroids (k-d tree or brute force)
//! - **Metrics** — proximity, front proximity, spatial autocorrelation
//!
//! # Quick start
//!
//! ```
//! use tessera_spatial::shape::Polygon;
//!
//! let cell = Polygon::from_bounding_box(0.0, 0.0, 4.0, 2.0);
//! let decoded = Polygon::from_base64(&cell.to_base64()).unwrap();
//! assert_eq!(decoded.area(), 8.0);
//! assert_eq!((decoded.centroid().x, decoded.centroid().y), (2.0, 1.0));
//! ```

pub mod autocorrelation;
pub mod features;
pub mod front;
pub mod index;
pub mod matrix;
pub mod proximity;
pub mod shape;
pub mod signature;

pub use features::{DerivationMethod, FeatureBatch, FeatureValue};
pub use index::{BruteForceBuilder, IndexBuilder, KdTreeBuilder, Neighbor, SpatialIndex};
pub use matrix::{
    assemble_feature_matrix, CellGeometry, Compartment, EncodingMode, ExpressionRow, FeatureMatrix, MatrixTable,
};
pub use proximity::{CellAreaSum, ProximityConfig, ProximityRecord, RegionalAreas};
pub use shape::{Point, Polygon};
pub use signature::{Channel, ChannelIndex, Expression, Phenotype, PhenotypeCriteria, PhenotypeSignature, Signature};
