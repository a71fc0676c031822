use std::cmp::Ordering;

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A latitude/longitude pair stored as a field value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || latitude.abs() > 90.0 {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, but was: {latitude}"
            )));
        }
        if !longitude.is_finite() || longitude.abs() > 180.0 {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, but was: {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Orders by latitude, then longitude.
    pub fn compare(&self, other: &GeoPoint) -> Ordering {
        self.latitude
            .total_cmp(&other.latitude)
            .then_with(|| self.longitude.total_cmp(&other.longitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn rejects_out_of_range_and_nan() {
        for (latitude, longitude) in [(100.0, 0.0), (0.0, -181.0), (f64::NAN, 0.0)] {
            let err = GeoPoint::new(latitude, longitude).unwrap_err();
            assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        }
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn orders_by_latitude_first() {
        let a = GeoPoint::new(1.0, 50.0).unwrap();
        let b = GeoPoint::new(2.0, 0.0).unwrap();
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
    }
}
