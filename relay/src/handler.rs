//! The payload-mutation hook shared by both relay directions.

/// Rewrites every forwarded datagram: keep a leading share of the
/// original bytes and append a share of repeated filler content.
/// Stateless, so one instance serves all sessions.
pub struct Handler {
    reserve_rate: f64,
    new_rate: f64,
    new_content: Vec<u8>,
}

impl Handler {
    pub fn new(reserve_rate: f64, new_rate: f64, new_content: &[u8]) -> Self {
        Self {
            reserve_rate,
            new_rate,
            new_content: new_content.to_vec(),
        }
    }

    /// # Test
    ///
    /// ```
    /// use flowgen_relay::handler::Handler;
    ///
    /// let handler = Handler::new(0.5, 0.2, b"ab");
    /// let output = handler.handle(&[b'z'; 100]);
    ///
    /// assert_eq!(output.len(), 70);
    /// assert_eq!(&output[..50], &[b'z'; 50]);
    /// assert_eq!(&output[50..], b"abababababababababab");
    /// ```
    pub fn handle(&self, data: &[u8]) -> Vec<u8> {
        let keep = ((data.len() as f64 * self.reserve_rate) as usize).min(data.len());
        let append = (data.len() as f64 * self.new_rate) as usize;

        let mut output = Vec::with_capacity(keep + append);
        output.extend_from_slice(&data[..keep]);

        if !self.new_content.is_empty() {
            output.extend(self.new_content.iter().cycle().take(append));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_filler_to_length() {
        let handler = Handler::new(0.0, 0.5, b"-uestc-");
        let output = handler.handle(&[0u8; 10]);

        // 5 bytes of a 7-byte pattern.
        assert_eq!(output, b"-uest");
    }

    #[test]
    fn test_shares_round_down() {
        let handler = Handler::new(0.5, 0.2, b"ab");
        let output = handler.handle(&[1u8; 7]);

        // 7 * 0.5 keeps 3, 7 * 0.2 appends 1.
        assert_eq!(output.len(), 4);
        assert_eq!(&output[..3], &[1, 1, 1]);
        assert_eq!(output[3], b'a');
    }

    #[test]
    fn test_zero_rates_drop_everything() {
        let handler = Handler::new(0.0, 0.0, b"ab");
        assert!(handler.handle(&[1u8; 100]).is_empty());
    }

    #[test]
    fn test_full_reserve_is_identity() {
        let handler = Handler::new(1.0, 0.0, b"ab");
        let input = [7u8; 64];
        assert_eq!(handler.handle(&input), &input);
    }

    #[test]
    fn test_empty_filler_appends_nothing() {
        let handler = Handler::new(0.5, 0.5, b"");
        assert_eq!(handler.handle(&[2u8; 10]).len(), 5);
    }
}
