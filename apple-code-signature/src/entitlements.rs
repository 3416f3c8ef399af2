// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling. */

use {
    crate::{code_directory::ExecutableSegmentFlags, error::CodeSignError},
    plist::Value,
    rasn::{
        ber::enc::{Encoder as DerEncoder, Error as DerError},
        enc::Error,
        types::{Class, Tag},
        Encoder,
    },
    std::collections::BTreeMap,
};

/// Encode a [Value] to DER, writing to an encoder.
fn der_encode_value(encoder: &mut DerEncoder, value: &Value) -> Result<(), DerError> {
    match value {
        Value::Boolean(v) => encoder.encode_bool(Tag::BOOL, *v),
        Value::Integer(v) => {
            let v = v
                .as_signed()
                .ok_or_else(|| DerError::custom("integer out of range"))?;
            encoder.encode_integer(Tag::INTEGER, &rasn::types::Integer::from(v))
        }
        Value::String(string) => encoder.encode_utf8_string(Tag::UTF8_STRING, string),
        Value::Array(array) => encoder.encode_sequence(Tag::SEQUENCE, |encoder| {
            for v in array {
                der_encode_value(encoder, v)?;
            }
            Ok(())
        }),
        Value::Dictionary(dict) => {
            // Keys are emitted in sorted order.
            let map = dict.into_iter().collect::<BTreeMap<_, _>>();
            encoder.encode_sequence(Tag::new(Class::Context, 16), |encoder| {
                for (k, v) in map {
                    encoder.encode_sequence(Tag::SEQUENCE, |encoder| {
                        encoder.encode_utf8_string(Tag::UTF8_STRING, k)?;
                        der_encode_value(encoder, v)?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        _ => Err(DerError::custom("plist value type has no DER encoding")),
    }
}

/// Encode an entitlements plist to DER.
pub fn der_encode_entitlements_plist(value: &Value) -> Result<Vec<u8>, CodeSignError> {
    rasn::der::encode_scope(|encoder| {
        encoder.encode_sequence(Tag::new(Class::Application, 16), |encoder| {
            encoder.encode_integer(Tag::INTEGER, &rasn::types::Integer::from(1))?;
            der_encode_value(encoder, value)?;
            Ok(())
        })
    })
    .map_err(|e| CodeSignError::EntitlementsDerEncode(format!("{}", e)))
}

/// Parse entitlements XML into a plist value.
///
/// The root must be a dictionary.
pub fn parse_entitlements_xml(xml: &str) -> Result<Value, CodeSignError> {
    let value = Value::from_reader_xml(xml.as_bytes())?;

    if value.as_dictionary().is_none() {
        return Err(CodeSignError::BadDictionaryFormat(
            "entitlements root is not a dictionary".into(),
        ));
    }

    Ok(value)
}

/// Resolve executable segment flags implied by an entitlements plist.
pub fn plist_to_executable_segment_flags(value: &Value) -> ExecutableSegmentFlags {
    let mut flags = ExecutableSegmentFlags::empty();

    let d = match value {
        Value::Dictionary(d) => d,
        _ => return flags,
    };

    let enabled = |key: &str| matches!(d.get(key), Some(Value::Boolean(true)));

    if enabled("get-task-allow") || enabled("run-unsigned-code") {
        flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
    }
    if enabled("com.apple.private.cs.debugger") {
        flags |= ExecutableSegmentFlags::DEBUGGER;
    }
    if enabled("dynamic-codesigning") {
        flags |= ExecutableSegmentFlags::JIT;
    }
    if enabled("com.apple.private.skip-library-validation") {
        flags |= ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION;
    }
    if enabled("com.apple.private.amfi.can-load-cdhash") {
        flags |= ExecutableSegmentFlags::CAN_LOAD_CD_HASH;
    }
    if enabled("com.apple.private.amfi.can-execute-cdhash") {
        flags |= ExecutableSegmentFlags::CAN_EXEC_CD_HASH;
    }

    flags
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const DER_EMPTY_DICT: &[u8] = &[112, 5, 2, 1, 1, 176, 0];
    const DER_BOOL_TRUE: &[u8] = &[
        112, 15, 2, 1, 1, 176, 10, 48, 8, 12, 3, 107, 101, 121, 1, 1, 255,
    ];
    const DER_INTEGER_42: &[u8] = &[
        112, 15, 2, 1, 1, 176, 10, 48, 8, 12, 3, 107, 101, 121, 2, 1, 42,
    ];
    const DER_ARRAY_TRUE_FOO: &[u8] = &[
        112, 22, 2, 1, 1, 176, 17, 48, 15, 12, 3, 107, 101, 121, 48, 8, 1, 1, 255, 12, 3, 102, 111,
        111,
    ];

    #[test]
    fn der_encoding() -> Result<(), CodeSignError> {
        let mut d = plist::Dictionary::new();
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(d.clone()))?,
            DER_EMPTY_DICT
        );

        d.insert("key".into(), Value::Boolean(true));
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(d.clone()))?,
            DER_BOOL_TRUE
        );

        d.insert("key".into(), Value::Integer(42u32.into()));
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(d.clone()))?,
            DER_INTEGER_42
        );

        d.insert(
            "key".into(),
            Value::Array(vec![Value::Boolean(true), Value::String("foo".into())]),
        );
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(d.clone()))?,
            DER_ARRAY_TRUE_FOO
        );

        d.insert("key".into(), Value::Data(b"foo".to_vec()));
        assert!(matches!(
            der_encode_entitlements_plist(&Value::Dictionary(d)),
            Err(CodeSignError::EntitlementsDerEncode(_))
        ));

        Ok(())
    }

    #[test]
    fn segment_flags_from_xml() -> Result<(), CodeSignError> {
        let value = parse_entitlements_xml(indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>get-task-allow</key>
                <true/>
                <key>dynamic-codesigning</key>
                <false/>
            </dict>
            </plist>
        "#})?;

        assert_eq!(
            plist_to_executable_segment_flags(&value),
            ExecutableSegmentFlags::ALLOW_UNSIGNED
        );

        assert!(matches!(
            parse_entitlements_xml(indoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <plist version="1.0">
                <array/>
                </plist>
            "#}),
            Err(CodeSignError::BadDictionaryFormat(_))
        ));

        Ok(())
    }
}
