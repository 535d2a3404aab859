//! Grouping of parameters into block read requests.

use crate::config::{BatchConfig, RegisterType};

/// One Modbus read covering one or more parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    /// Indices into the parameter list, in address order.
    pub params: Vec<usize>,
}

impl ReadRequest {
    fn single(register_type: RegisterType, address: u16, index: usize) -> Self {
        Self {
            register_type,
            start: address,
            count: 1,
            params: vec![index],
        }
    }

    /// Address of the last register covered.
    pub fn end(&self) -> u16 {
        self.start + (self.count - 1)
    }
}

/// Split a node's parameters into read requests.
///
/// `items[i]` is the register type and wire address of parameter `i`. With
/// batching enabled the result is sorted by register type then start address
/// and every span stays within `max_bits` or `max_registers`. Without
/// batching there is one request per parameter, in parameter order.
pub fn plan_reads(items: &[(RegisterType, u16)], limits: &BatchConfig) -> Vec<ReadRequest> {
    if !limits.enabled {
        return items
            .iter()
            .enumerate()
            .map(|(i, &(register_type, address))| ReadRequest::single(register_type, address, i))
            .collect();
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| (items[i].0, items[i].1, i));

    let mut requests: Vec<ReadRequest> = Vec::new();
    for i in order {
        let (register_type, address) = items[i];
        let limit = u32::from(if register_type.is_bit() {
            limits.max_bits
        } else {
            limits.max_registers
        })
        .max(1);

        if let Some(current) = requests.last_mut() {
            let fits = current.register_type == register_type
                && u32::from(address) <= u32::from(current.end()) + u32::from(limits.max_gap) + 1
                && u32::from(address) - u32::from(current.start) < limit;
            if fits {
                current.count = current.count.max(address - current.start + 1);
                current.params.push(i);
                continue;
            }
        }

        requests.push(ReadRequest::single(register_type, address, i));
    }

    requests
}
