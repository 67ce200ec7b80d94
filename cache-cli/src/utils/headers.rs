use crate::error::AppError;

/// Split a "Name: Value" argument into its trimmed parts
pub fn split_header(header: &str) -> Result<(&str, &str), AppError> {
    let Some((name, value)) = header.split_once(':') else {
        return Err(AppError::InvalidInput(format!(
            "invalid header format: '{header}', expected 'Name: Value'"
        )));
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "missing header name in '{header}'"
        )));
    }
    Ok((name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_colon() {
        let (name, value) = split_header("Referer: http://example.com/a").unwrap();
        assert_eq!(name, "Referer");
        assert_eq!(value, "http://example.com/a");
    }

    #[test]
    fn rejects_missing_name_or_colon() {
        assert!(split_header("no-colon").is_err());
        assert!(split_header(": value").is_err());
    }
}
