mod buffered_readings;
mod vector_points;

pub use vector_points::{CollectionRow, PayloadPredicate, PointRow};
