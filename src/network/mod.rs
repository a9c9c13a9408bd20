/*
 * This module defines the addressing vocabulary shared by the topology engine:
 * local interface descriptors and normalized subnet keys.
 */

pub mod interface;
pub mod subnet;
