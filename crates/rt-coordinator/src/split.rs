//! `split_model_layers` (§4.8): divides `total_layers` as evenly as
//! possible across `client_count` clients, giving the first
//! `total_layers % client_count` clients one extra layer so every client
//! differs in size by at most one layer.

use rt_core::LayerRange;

pub fn split_model_layers(total_layers: usize, client_count: usize) -> Vec<LayerRange> {
    if client_count == 0 {
        return Vec::new();
    }
    let base = total_layers / client_count;
    let remainder = total_layers % client_count;
    let mut ranges = Vec::with_capacity(client_count);
    let mut start = 0;
    for i in 0..client_count {
        let len = base + if i < remainder { 1 } else { 0 };
        ranges.push(LayerRange::new(start, start + len));
        start += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evenly_divisible_gives_equal_ranges() {
        let ranges = split_model_layers(8, 4);
        assert_eq!(ranges, vec![
            LayerRange::new(0, 2),
            LayerRange::new(2, 4),
            LayerRange::new(4, 6),
            LayerRange::new(6, 8),
        ]);
    }

    #[test]
    fn remainder_goes_to_first_clients() {
        let ranges = split_model_layers(10, 3);
        assert_eq!(ranges, vec![
            LayerRange::new(0, 4),
            LayerRange::new(4, 7),
            LayerRange::new(7, 10),
        ]);
        assert!(LayerRange::covers_contiguously(&ranges, 10));
    }

    #[test]
    fn single_client_gets_everything() {
        let ranges = split_model_layers(6, 1);
        assert_eq!(ranges, vec![LayerRange::new(0, 6)]);
    }
}
