#[derive(Debug)]
pub struct IdempotencyKey(String);

impl TryFrom<String> for IdempotencyKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            anyhow::bail!("idempotency key cannot be empty")
        }
        let max_chars = 64;
        if value.len() > max_chars {
            anyhow::bail!("idempotency key cannot be longer than {max_chars} characters")
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use claims::assert_ok;

    use super::IdempotencyKey;

    #[test]
    fn empty_and_oversized_keys_are_rejected() {
        assert_err!(IdempotencyKey::try_from(String::new()));
        assert_err!(IdempotencyKey::try_from("k".repeat(65)));
        assert_ok!(IdempotencyKey::try_from("k".repeat(64)));
    }
}
