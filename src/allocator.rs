//! Deterministic port and subnet allocation
//!
//! Both allocators are pure: the caller passes every value that must be
//! avoided and gets the same answer for the same input.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::models::{PORT_FLOOR, SUBNET_MAX, SUBNET_MIN};

/// First-fit SSH port allocation
pub struct PortAllocator;

impl PortAllocator {
    /// Lowest port at or above 2222 that is not excluded.
    pub fn allocate(excluded: &HashSet<u32>) -> u32 {
        let mut port = PORT_FLOOR;
        while excluded.contains(&port) {
            port += 1;
        }
        port
    }
}

/// Hash-based subnet allocation with linear probing
pub struct SubnetAllocator;

impl SubnetAllocator {
    const SPAN: u32 = (SUBNET_MAX - SUBNET_MIN + 1) as u32;

    /// Subnet a student hashes to before any collision probing.
    pub fn natural(student_id: &str) -> u8 {
        let digest = Sha256::digest(student_id.as_bytes());
        // Whole digest as a big-endian integer, reduced mod 254.
        let reduced = digest
            .iter()
            .fold(0u32, |acc, byte| (acc * 256 + *byte as u32) % Self::SPAN);
        (reduced as u8) + SUBNET_MIN
    }

    /// Natural subnet, or the next free one probing upward and wrapping
    /// 254 -> 1. When every subnet is excluded the natural one is returned.
    pub fn allocate(student_id: &str, excluded: &HashSet<u8>) -> u8 {
        let natural = Self::natural(student_id);
        let mut candidate = natural;
        while excluded.contains(&candidate) {
            candidate = Self::next(candidate);
            if candidate == natural {
                tracing::warn!(student = %student_id, subnet = natural, "All subnets in use, reusing natural subnet");
                break;
            }
        }
        candidate
    }

    fn next(subnet: u8) -> u8 {
        if subnet >= SUBNET_MAX {
            SUBNET_MIN
        } else {
            subnet + 1
        }
    }
}
