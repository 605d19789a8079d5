//! Patricia trie for longest-prefix match on IP addresses
//!
//! Classical binary radix tree keyed on address bits, supporting the 32-bit
//! (IPv4) and 128-bit (IPv6) key spaces. Nodes live in an arena and refer to
//! each other by index; glue nodes carry no prefix and always have exactly
//! two children.
//!
//! A published tree is never mutated: the resolver builds a fresh tree on
//! reconfiguration and swaps it in as a whole generation.

use std::net::IpAddr;

use crate::core::SubnetCidr;

/// Address bits plus prefix length, the internal key form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Prefix {
    bytes: [u8; 16],
    len: u8,
}

impl Prefix {
    fn from_subnet(subnet: &SubnetCidr) -> Self {
        let mut bytes = [0u8; 16];
        match subnet.address() {
            IpAddr::V4(v4) => bytes[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => bytes.copy_from_slice(&v6.octets()),
        }
        Self { bytes, len: subnet.prefix_len() }
    }

    fn from_addr(addr: IpAddr) -> Self {
        Self::from_subnet(&SubnetCidr::host(addr))
    }

    fn to_subnet(self, maxbits: u8) -> SubnetCidr {
        let address = if maxbits == 32 {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.bytes[..4]);
            IpAddr::from(octets)
        } else {
            IpAddr::from(self.bytes)
        };
        SubnetCidr::new(address, self.len)
    }
}

fn bit_set(bytes: &[u8; 16], bit: u8) -> bool {
    bytes[(bit >> 3) as usize] & (0x80 >> (bit & 7)) != 0
}

fn first_differing_bit(a: &[u8; 16], b: &[u8; 16], limit: u8) -> u8 {
    for bit in 0..limit {
        if bit_set(a, bit) != bit_set(b, bit) {
            return bit;
        }
    }
    limit
}

/// Masked comparison: does `candidate` (of `len` bits) contain `addr`?
fn contains_bits(candidate: &[u8; 16], addr: &[u8; 16], len: u8) -> bool {
    first_differing_bit(candidate, addr, len) == len
}

struct Node<T> {
    /// Bit index tested when descending through this node; equals the
    /// prefix length for prefix-bearing nodes
    bit: u8,
    prefix: Option<Prefix>,
    value: Option<T>,
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
}

/// Arena-backed Patricia trie
pub struct PatriciaTree<T> {
    nodes: Vec<Node<T>>,
    root: Option<u32>,
    maxbits: u8,
    prefix_count: usize,
}

impl<T> PatriciaTree<T> {
    /// Create a tree for one key space: 32 (IPv4) or 128 (IPv6) bits
    pub fn new(maxbits: u8) -> Self {
        debug_assert!(maxbits == 32 || maxbits == 128);
        Self {
            nodes: Vec::new(),
            root: None,
            maxbits,
            prefix_count: 0,
        }
    }

    pub fn ipv4() -> Self {
        Self::new(32)
    }

    pub fn ipv6() -> Self {
        Self::new(128)
    }

    /// Number of stored prefixes
    pub fn len(&self) -> usize {
        self.prefix_count
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_count == 0
    }

    fn alloc(&mut self, node: Node<T>) -> u32 {
        let idx = self.nodes.len() as u32;
        self.nodes.push(node);
        idx
    }

    /// Insert a prefix with its payload. Returns the previous payload when
    /// the prefix was already present.
    pub fn insert(&mut self, subnet: SubnetCidr, value: T) -> Option<T> {
        debug_assert_eq!(subnet.is_ipv6(), self.maxbits == 128, "subnet family must match the tree");

        let key = Prefix::from_subnet(&subnet);
        let len = key.len;

        let Some(root) = self.root else {
            let idx = self.alloc(Node {
                bit: len,
                prefix: Some(key),
                value: Some(value),
                parent: None,
                left: None,
                right: None,
            });
            self.root = Some(idx);
            self.prefix_count += 1;
            return None;
        };

        // Descend to the closest existing prefix node
        let mut node = root;
        loop {
            let n = &self.nodes[node as usize];
            if n.bit >= len && n.prefix.is_some() {
                break;
            }
            let child = if n.bit < self.maxbits && bit_set(&key.bytes, n.bit) {
                n.right
            } else {
                n.left
            };
            match child {
                Some(c) => node = c,
                None => break,
            }
        }

        // Glue nodes always have two children, so the descent ends on a
        // prefix-bearing node.
        let test = self.nodes[node as usize]
            .prefix
            .expect("descent must end on a prefix node");

        let check_bit = self.nodes[node as usize].bit.min(len);
        let differ_bit = first_differing_bit(&key.bytes, &test.bytes, check_bit);

        // Walk back up to the insertion point
        let mut parent = self.nodes[node as usize].parent;
        while let Some(p) = parent {
            if self.nodes[p as usize].bit < differ_bit {
                break;
            }
            node = p;
            parent = self.nodes[node as usize].parent;
        }

        let node_bit = self.nodes[node as usize].bit;

        if differ_bit == len && node_bit == len {
            // Exact slot: replace payload, or fill a glue node
            let n = &mut self.nodes[node as usize];
            if n.prefix.is_some() {
                return n.value.replace(value);
            }
            n.prefix = Some(key);
            n.value = Some(value);
            self.prefix_count += 1;
            return None;
        }

        let new_idx = self.alloc(Node {
            bit: len,
            prefix: Some(key),
            value: Some(value),
            parent: None,
            left: None,
            right: None,
        });
        self.prefix_count += 1;

        if node_bit == differ_bit {
            // New leaf hangs directly off `node`
            self.nodes[new_idx as usize].parent = Some(node);
            if node_bit < self.maxbits && bit_set(&key.bytes, node_bit) {
                self.nodes[node as usize].right = Some(new_idx);
            } else {
                self.nodes[node as usize].left = Some(new_idx);
            }
        } else if len == differ_bit {
            // New node becomes the parent of `node`
            let old_parent = self.nodes[node as usize].parent;
            if len < self.maxbits && bit_set(&test.bytes, len) {
                self.nodes[new_idx as usize].right = Some(node);
            } else {
                self.nodes[new_idx as usize].left = Some(node);
            }
            self.nodes[new_idx as usize].parent = old_parent;
            self.relink(old_parent, node, new_idx);
            self.nodes[node as usize].parent = Some(new_idx);
        } else {
            // Branch point between `node` and the new leaf
            let old_parent = self.nodes[node as usize].parent;
            let glue = self.alloc(Node {
                bit: differ_bit,
                prefix: None,
                value: None,
                parent: old_parent,
                left: None,
                right: None,
            });
            if differ_bit < self.maxbits && bit_set(&key.bytes, differ_bit) {
                self.nodes[glue as usize].right = Some(new_idx);
                self.nodes[glue as usize].left = Some(node);
            } else {
                self.nodes[glue as usize].left = Some(new_idx);
                self.nodes[glue as usize].right = Some(node);
            }
            self.nodes[new_idx as usize].parent = Some(glue);
            self.relink(old_parent, node, glue);
            self.nodes[node as usize].parent = Some(glue);
        }

        None
    }

    fn relink(&mut self, parent: Option<u32>, old_child: u32, new_child: u32) {
        match parent {
            None => self.root = Some(new_child),
            Some(p) => {
                let pn = &mut self.nodes[p as usize];
                if pn.right == Some(old_child) {
                    pn.right = Some(new_child);
                } else {
                    pn.left = Some(new_child);
                }
            }
        }
    }

    /// Longest-prefix match for a full address.
    ///
    /// With `inclusive = false` only a strictly-shorter prefix than the
    /// queried length can match, i.e. a stored /32 never matches its own
    /// address.
    pub fn search_best(&self, addr: IpAddr, inclusive: bool) -> Option<(SubnetCidr, &T)> {
        if addr.is_ipv6() != (self.maxbits == 128) {
            return None;
        }
        self.search_best_bits(&Prefix::from_addr(addr).bytes, self.maxbits, inclusive)
    }

    fn search_best_bits(&self, bytes: &[u8; 16], bitlen: u8, inclusive: bool) -> Option<(SubnetCidr, &T)> {
        let mut current = Some(self.root?);
        let mut stack: Vec<u32> = Vec::new();

        while let Some(idx) = current {
            let n = &self.nodes[idx as usize];
            if n.bit >= bitlen {
                break;
            }
            if n.prefix.is_some() {
                stack.push(idx);
            }
            current = if bit_set(bytes, n.bit) { n.right } else { n.left };
        }
        if let Some(idx) = current {
            if self.nodes[idx as usize].prefix.is_some() {
                stack.push(idx);
            }
        }

        while let Some(idx) = stack.pop() {
            let n = &self.nodes[idx as usize];
            let prefix = n.prefix.as_ref().expect("only prefix nodes are stacked");
            if prefix.len > bitlen {
                continue;
            }
            if !inclusive && prefix.len == bitlen {
                continue;
            }
            if contains_bits(&prefix.bytes, bytes, prefix.len) {
                return Some((prefix.to_subnet(self.maxbits), n.value.as_ref().expect("prefix nodes carry a value")));
            }
        }

        None
    }

    /// Visit every stored prefix in depth-first order
    pub fn walk<F: FnMut(SubnetCidr, &T)>(&self, mut visitor: F) {
        let Some(root) = self.root else { return };
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let n = &self.nodes[idx as usize];
            if let (Some(prefix), Some(value)) = (&n.prefix, &n.value) {
                visitor(prefix.to_subnet(self.maxbits), value);
            }
            if let Some(r) = n.right {
                stack.push(r);
            }
            if let Some(l) = n.left {
                stack.push(l);
            }
        }
    }
}
