use geo::GeodesicArea;

/// Mean length of one degree of latitude on the WGS84 ellipsoid, in metres.
pub const METRES_PER_DEGREE: f64 = 111_320.0;

/// Equirectangular projection of WGS84 lon/lat around a reference latitude.
///
/// Distances are accurate to well below a percent over the extent of a city, which is all
/// the nearest-neighbour search and grid generation need. Not suitable for areas spanning
/// many degrees of latitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    cos_reference_lat: f64,
}

impl LocalProjection {
    pub fn new(reference_lat: f64) -> Self {
        Self {
            cos_reference_lat: reference_lat.to_radians().cos(),
        }
    }

    /// Project a lon/lat coordinate to metres.
    pub fn project(&self, coord: &geo::Coord) -> [f64; 2] {
        [
            coord.x * METRES_PER_DEGREE * self.cos_reference_lat,
            coord.y * METRES_PER_DEGREE,
        ]
    }

    /// Size in degrees (longitude, latitude) of a square with the given side in metres.
    pub fn degrees_for_metres(&self, metres: f64) -> (f64, f64) {
        (
            metres / (METRES_PER_DEGREE * self.cos_reference_lat),
            metres / METRES_PER_DEGREE,
        )
    }
}

/// Area in square metres of a lon/lat geometry on the WGS84 ellipsoid.
pub fn geodesic_area_m2<G: GeodesicArea<f64>>(geometry: &G) -> f64 {
    geometry.geodesic_area_unsigned()
}
