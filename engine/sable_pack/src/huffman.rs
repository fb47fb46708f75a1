//! Huffman-coded byte streams.
//!
//! The header stores one normalised frequency byte per possible value,
//! run-length encoding runs of zeros: a zero frequency is followed by the
//! count of additional zeros. Each compressed block is prefixed by a
//! compact index holding its byte length; the first byte of a block stores
//! the number of meaningful bits in its final byte.

use crate::compact::{read_compact_index, write_compact_index};
use crate::PackError;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

const NUM_BYTE_VALUES: usize = 256;

enum Tree {
    Leaf(u8),
    Node(Box<Tree>, Box<Tree>),
}

/// Build the coding tree from the normalised frequency table.
///
/// All 256 values participate, zero-frequency ones with weight zero, so the
/// decoder's tree is complete no matter the data. Ties order by smallest
/// contained value to keep the tree deterministic.
fn build_tree(frequencies: &[u8; NUM_BYTE_VALUES]) -> Tree {
    // (weight, smallest value in subtree) is the priority key.
    let mut heap: BinaryHeap<Reverse<(u64, u8, usize)>> = BinaryHeap::new();
    let mut arena: Vec<Tree> = Vec::with_capacity(2 * NUM_BYTE_VALUES);
    for value in 0..NUM_BYTE_VALUES {
        arena.push(Tree::Leaf(value as u8));
        heap.push(Reverse((u64::from(frequencies[value]), value as u8, value)));
    }

    while heap.len() > 1 {
        let Reverse((weight_a, min_a, index_a)) = heap.pop().unwrap_or(Reverse((0, 0, 0)));
        let Reverse((weight_b, _min_b, index_b)) = heap.pop().unwrap_or(Reverse((0, 0, 0)));
        let left = std::mem::replace(&mut arena[index_a], Tree::Leaf(0));
        let right = std::mem::replace(&mut arena[index_b], Tree::Leaf(0));
        let index = arena.len();
        arena.push(Tree::Node(Box::new(left), Box::new(right)));
        heap.push(Reverse((weight_a + weight_b, min_a, index)));
    }

    let Reverse((_, _, root)) = heap.pop().unwrap_or(Reverse((0, 0, 0)));
    arena.swap_remove(root)
}

/// Derive the bit code for every value by walking the tree breadth-first.
fn build_codes(tree: &Tree) -> Vec<Vec<bool>> {
    let mut codes = vec![Vec::new(); NUM_BYTE_VALUES];
    let mut queue: std::collections::VecDeque<(&Tree, Vec<bool>)> =
        std::collections::VecDeque::new();
    queue.push_back((tree, Vec::new()));
    while let Some((node, code)) = queue.pop_front() {
        match node {
            Tree::Leaf(value) => codes[*value as usize] = code,
            Tree::Node(left, right) => {
                let mut left_code = code.clone();
                left_code.push(false);
                queue.push_back((left, left_code));
                let mut right_code = code;
                right_code.push(true);
                queue.push_back((right, right_code));
            }
        }
    }
    codes
}

fn normalised_frequencies(data: &[u8]) -> [u8; NUM_BYTE_VALUES] {
    let mut counts = [0usize; NUM_BYTE_VALUES];
    for &b in data {
        counts[b as usize] += 1;
    }
    let max_count = counts.iter().copied().max().unwrap_or(0);

    let mut normalised = [0u8; NUM_BYTE_VALUES];
    if max_count == 0 {
        return normalised;
    }
    for (value, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        // Scale into u8 range but keep every present value representable.
        normalised[value] = ((255 * count / max_count) as u8).max(1);
    }
    normalised
}

fn encode_block(data: &[u8], codes: &[Vec<bool>]) -> Vec<u8> {
    let mut block: Vec<u8> = Vec::with_capacity(1 + data.len() / 4);
    block.push(0);

    // The first byte stores the number of meaningful bits in the last byte.
    let mut ending_bit: usize = 8;
    let mut current_byte = 1usize;
    let mut current_bit = 0u32;

    for &b in data {
        let code = &codes[b as usize];
        ending_bit += code.len();
        block.resize(ending_bit.div_ceil(8), 0);
        for &bit in code {
            if bit {
                block[current_byte] |= 1 << current_bit;
            }
            current_bit += 1;
            if current_bit == 8 {
                current_bit = 0;
                current_byte += 1;
            }
        }
    }

    block[0] = (ending_bit % 8) as u8;
    block
}

fn decode_block(block: &[u8], tree: &Tree) -> Vec<u8> {
    if block.len() < 2 {
        return Vec::new();
    }
    let mut end_bit = 8 * block.len();
    if block[0] != 0 {
        end_bit = end_bit - 8 + block[0] as usize;
    }

    let mut out = Vec::new();
    let mut bit = 8usize;
    while bit < end_bit {
        let mut node = tree;
        loop {
            match node {
                Tree::Leaf(value) => {
                    out.push(*value);
                    break;
                }
                Tree::Node(left, right) => {
                    if bit >= end_bit {
                        // Ran out mid-code: trailing padding, stop cleanly.
                        return out;
                    }
                    let set = block[bit / 8] & (1 << (bit % 8)) != 0;
                    node = if set { right } else { left };
                    bit += 1;
                }
            }
        }
    }
    out
}

/// Compress `data` into the packed form. Empty input produces the
/// zero-frequency header and no blocks.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let frequencies = normalised_frequencies(data);

    let mut out = Vec::with_capacity(2 * NUM_BYTE_VALUES + data.len() / 2);
    let mut value = 0usize;
    while value < NUM_BYTE_VALUES {
        out.push(frequencies[value]);
        if frequencies[value] == 0 {
            let mut additional_zeros = 0u8;
            while value + 1 < NUM_BYTE_VALUES && frequencies[value + 1] == 0 {
                additional_zeros += 1;
                value += 1;
            }
            out.push(additional_zeros);
        }
        value += 1;
    }

    if data.is_empty() {
        return out;
    }

    let tree = build_tree(&frequencies);
    let codes = build_codes(&tree);
    let block = encode_block(data, &codes);
    write_compact_index(&mut out, block.len());
    out.extend_from_slice(&block);
    out
}

/// Reverse [`compress`], concatenating every block.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut frequencies = [0u8; NUM_BYTE_VALUES];
    let mut offset = 0usize;
    let mut value = 0usize;
    while value < NUM_BYTE_VALUES {
        let Some(&frequency) = data.get(offset) else {
            return Err(PackError::Truncated);
        };
        offset += 1;
        frequencies[value] = frequency;
        if frequency == 0 {
            let Some(&additional_zeros) = data.get(offset) else {
                return Err(PackError::Truncated);
            };
            offset += 1;
            value += additional_zeros as usize;
        }
        value += 1;
    }

    let mut out = Vec::new();
    if offset >= data.len() {
        return Ok(out);
    }

    let tree = build_tree(&frequencies);
    while offset < data.len() {
        let length = read_compact_index(data, &mut offset)?;
        let end = offset.checked_add(length).ok_or(PackError::Truncated)?;
        if end > data.len() {
            return Err(PackError::BlockOverrun { offset, length });
        }
        out.extend(decode_block(&data[offset..end], &tree));
        offset = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_simple_strings() {
        for case in [
            &b""[..],
            b"a",
            b"hello world",
            b"aaaaaaaaaabbbbbccc",
            b"\x00\x01\x02\xFF\xFE",
        ] {
            let packed = compress(case);
            assert_eq!(decompress(&packed).expect("decompress"), case);
        }
    }

    #[test]
    fn empty_input_is_header_only() {
        let packed = compress(b"");
        // 0 frequency followed by 255 additional zeros covers the table.
        assert_eq!(packed, vec![0, 255]);
        assert_eq!(decompress(&packed).expect("decompress"), Vec::<u8>::new());
    }

    #[test]
    fn skewed_data_compresses() {
        let data: Vec<u8> = std::iter::repeat(b'x')
            .take(4000)
            .chain(std::iter::repeat(b'y').take(40))
            .collect();
        let packed = compress(&data);
        assert!(packed.len() < data.len() / 2, "packed {} bytes", packed.len());
        assert_eq!(decompress(&packed).expect("decompress"), data);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert_eq!(decompress(&[5, 5, 5]), Err(PackError::Truncated));
    }

    #[test]
    fn overrunning_block_is_rejected() {
        let mut packed = compress(b"abc");
        // Dropping the final block byte makes the declared length overrun.
        packed.truncate(packed.len() - 1);
        assert!(decompress(&packed).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decompress_compress_is_identity(data in proptest::collection::vec(any::<u8>(), 0..600)) {
                let packed = compress(&data);
                prop_assert_eq!(decompress(&packed).expect("decompress"), data);
            }
        }
    }
}
