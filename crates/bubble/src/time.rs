/// Current time in milliseconds since the Unix epoch, as carried by location
/// timestamps.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_reasonable() {
        let ms = now_ms();
        assert!(ms > 1_704_067_200_000);
        assert!(ms < 4_102_444_800_000);
    }
}
