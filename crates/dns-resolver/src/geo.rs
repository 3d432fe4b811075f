//! MaxMind GeoIP2 lookups: country, ASN, and city coordinates for an
//! IP address. Used by the filter/selector to evaluate `country`,
//! `asn`, and `location` geo filters against both the querying
//! client's address and a candidate record's address.

use std::net::IpAddr;

use maxminddb::geoip2;

/// What we know about an IP address from the GeoIP databases.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<[u8; 2]>,
    pub asn: Option<u32>,
    pub coordinates: Option<(f64, f64)>,
}

impl GeoInfo {
    pub fn country_str(&self) -> Option<&str> {
        self.country
            .as_ref()
            .and_then(|c| std::str::from_utf8(c).ok())
    }
}

/// Wraps the (optional) country/ASN/city MaxMind readers. Any reader
/// not configured simply yields `None` for its dimension - this lets
/// a deployment run with only a subset of the databases present.
pub struct GeoDatabase {
    city: Option<maxminddb::Reader<Vec<u8>>>,
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoDatabase {
    pub fn empty() -> Self {
        Self {
            city: None,
            asn: None,
        }
    }

    pub fn open(city_path: Option<&str>, asn_path: Option<&str>) -> std::io::Result<Self> {
        let city = city_path
            .map(maxminddb::Reader::open_readfile)
            .transpose()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let asn = asn_path
            .map(maxminddb::Reader::open_readfile)
            .transpose()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        Ok(Self { city, asn })
    }

    pub fn lookup(&self, ip: IpAddr) -> GeoInfo {
        let mut info = GeoInfo::default();

        if let Some(reader) = &self.city {
            if let Ok(Some(city)) = reader.lookup::<geoip2::City>(ip) {
                if let Some(country) = city.country.as_ref().and_then(|c| c.iso_code) {
                    let bytes = country.as_bytes();
                    if bytes.len() == 2 {
                        info.country = Some([bytes[0], bytes[1]]);
                    }
                }
                if let Some(location) = city.location {
                    if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
                        info.coordinates = Some((lat, lon));
                    }
                }
            }
        }

        if let Some(reader) = &self.asn {
            if let Ok(Some(asn)) = reader.lookup::<geoip2::Asn>(ip) {
                info.asn = asn.autonomous_system_number;
            }
        }

        info
    }
}

/// Great-circle distance in kilometres between two (lat, lon) points.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_database_yields_no_info() {
        let db = GeoDatabase::empty();
        assert_eq!(GeoInfo::default(), db.lookup("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn haversine_is_zero_for_same_point() {
        assert!(haversine_km((51.5, -0.12), (51.5, -0.12)) < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance_roughly() {
        // London to Paris, ~344km
        let d = haversine_km((51.5074, -0.1278), (48.8566, 2.3522));
        assert!((300.0..400.0).contains(&d), "distance was {d}");
    }
}
