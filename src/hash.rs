//! Content fingerprint of an interface specification.
//!
//! Only unit content is hashed. Units are taken in id order and addresses as a
//! set, so neither declaration order nor duplicates change the fingerprint.

use crate::model::InterfaceSpec;
use std::collections::BTreeSet;

pub fn config_hash(spec: &InterfaceSpec) -> String {
    let mut units: Vec<(u32, BTreeSet<&str>)> = spec
        .units
        .iter()
        .map(|unit| (unit.id, unit.addresses.iter().map(|a| a.trim()).collect()))
        .collect();
    // addresses break ties between units sharing an id
    units.sort();

    let mut hasher = blake3::Hasher::new();
    for (id, addresses) in units {
        hasher.update(&id.to_be_bytes());
        hasher.update(&(addresses.len() as u64).to_be_bytes());
        for address in addresses {
            // length prefix keeps ["a", "bc"] and ["ab", "c"] apart
            hasher.update(&(address.len() as u64).to_be_bytes());
            hasher.update(address.as_bytes());
        }
    }

    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Unit;

    fn spec(identifier: &str, units: Vec<Unit>) -> InterfaceSpec {
        InterfaceSpec {
            interface_identifier: identifier.to_string(),
            units,
        }
    }

    #[test]
    fn test_stable() {
        let a = spec("ge-0/0/0", vec![Unit::new(0, ["10.0.0.1/24"])]);
        let b = spec("ge-0/0/0", vec![Unit::new(0, ["10.0.0.1/24"])]);
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);
    }

    #[test]
    fn test_order_independent() {
        let a = spec(
            "eth0",
            vec![
                Unit::new(0, ["10.0.0.1/24", "fd00::1/64"]),
                Unit::new(1, ["192.168.0.1/24"]),
            ],
        );
        let b = spec(
            "eth0",
            vec![
                Unit::new(1, ["192.168.0.1/24"]),
                Unit::new(0, ["fd00::1/64", "10.0.0.1/24", "10.0.0.1/24"]),
            ],
        );
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_duplicate_unit_ids_order_independent() {
        let a = spec(
            "eth0",
            vec![
                Unit::new(0, ["10.0.0.1/24"]),
                Unit::new(0, ["10.0.1.1/24"]),
            ],
        );
        let b = spec(
            "eth0",
            vec![
                Unit::new(0, ["10.0.1.1/24"]),
                Unit::new(0, ["10.0.0.1/24"]),
            ],
        );
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_address_change() {
        let a = spec("eth0", vec![Unit::new(0, ["10.0.0.1/24"])]);
        let b = spec("eth0", vec![Unit::new(0, ["10.0.0.2/24"])]);
        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn test_unit_change() {
        let a = spec("eth0", vec![Unit::new(0, ["10.0.0.1/24"])]);
        let moved = spec("eth0", vec![Unit::new(1, ["10.0.0.1/24"])]);
        let added = spec(
            "eth0",
            vec![Unit::new(0, ["10.0.0.1/24"]), Unit::new(1, Vec::<String>::new())],
        );
        assert_ne!(config_hash(&a), config_hash(&moved));
        assert_ne!(config_hash(&a), config_hash(&added));
    }

    #[test]
    fn test_identifier_not_hashed() {
        let a = spec("eth0", vec![Unit::new(0, ["10.0.0.1/24"])]);
        let b = spec("eth1", vec![Unit::new(0, ["10.0.0.1/24"])]);
        assert_eq!(config_hash(&a), config_hash(&b));
    }
}
