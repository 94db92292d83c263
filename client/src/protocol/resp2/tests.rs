/*
 * Created on Wed Mar 13 2024
 *
 * This file is a part of Sable
 * Sable is a free and open-source Redis-compatible client runtime written
 * by Sayan Nandan ("the Author") with the vision to provide a fast, correct
 * and fully pipelined way to talk to modern key/value servers.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    super::{decode, encode, Resp2Value},
    crate::protocol::ParseError,
};

fn decoded(input: &[u8]) -> (Resp2Value, usize) {
    decode(input).unwrap().expect("input held a complete value")
}

fn need_more(input: &[u8]) {
    assert_eq!(decode(input).unwrap(), None, "{input:?} should be partial");
}

// scalars

#[test]
fn integer() {
    let (value, consumed) = decoded(b":10\r\n");
    assert_eq!(value, Resp2Value::Integer(10));
    assert_eq!(consumed, 5);
}

#[test]
fn integer_negative() {
    assert_eq!(decoded(b":-42\r\n").0, Resp2Value::Integer(-42));
}

#[test]
fn integer_incomplete() {
    need_more(b":10");
    need_more(b":10\r");
}

#[test]
fn integer_bad_body() {
    assert_eq!(decode(b":1x\r\n").unwrap_err(), ParseError::CannotParseInteger);
}

#[test]
fn simple_string() {
    assert_eq!(decoded(b"+OK\r\n").0, Resp2Value::simple("OK"));
}

#[test]
fn error_reply() {
    assert_eq!(
        decoded(b"-ERR unknown command\r\n").0,
        Resp2Value::Error(bytes::Bytes::from_static(b"ERR unknown command"))
    );
}

#[test]
fn bulk_string() {
    let (value, consumed) = decoded(b"$5\r\nhello\r\n");
    assert_eq!(value, Resp2Value::bulk("hello"));
    assert_eq!(consumed, 11);
}

#[test]
fn bulk_string_null() {
    assert_eq!(decoded(b"$-1\r\n").0, Resp2Value::null_bulk());
}

#[test]
fn bulk_string_empty_is_not_null() {
    assert_eq!(decoded(b"$0\r\n\r\n").0, Resp2Value::bulk(""));
    assert_ne!(Resp2Value::bulk(""), Resp2Value::null_bulk());
}

#[test]
fn bulk_string_binary() {
    assert_eq!(decoded(b"$4\r\na\r\nb\r\n").0, Resp2Value::bulk(b"a\r\nb"));
}

#[test]
fn bulk_string_incomplete() {
    need_more(b"$5\r\n");
    need_more(b"$5\r\nhel");
    need_more(b"$5\r\nhello\r");
}

#[test]
fn bulk_bad_length() {
    assert_eq!(decode(b"$-2\r\n").unwrap_err(), ParseError::Malformed);
    assert_eq!(decode(b"$x\r\n").unwrap_err(), ParseError::Malformed);
}

// arrays

#[test]
fn array() {
    let (value, consumed) = decoded(b"*2\r\n$3\r\nfoo\r\n:7\r\n");
    assert_eq!(
        value,
        Resp2Value::Array(Some(vec![Resp2Value::bulk("foo"), Resp2Value::Integer(7)]))
    );
    assert_eq!(consumed, 18);
}

#[test]
fn array_null() {
    assert_eq!(decoded(b"*-1\r\n").0, Resp2Value::Array(None));
}

#[test]
fn array_empty_is_not_null() {
    assert_eq!(decoded(b"*0\r\n").0, Resp2Value::Array(Some(vec![])));
}

#[test]
fn array_nested() {
    let (value, _) = decoded(b"*1\r\n*1\r\n+x\r\n");
    assert_eq!(
        value,
        Resp2Value::Array(Some(vec![Resp2Value::Array(Some(vec![
            Resp2Value::simple("x")
        ]))]))
    );
}

#[test]
fn array_incomplete() {
    need_more(b"*2\r\n$3\r\nfoo\r\n");
    need_more(b"*2\r\n");
}

#[test]
fn invalid_leading_byte() {
    assert_eq!(decode(b"?1\r\n").unwrap_err(), ParseError::InvalidLeadingByte);
}

#[test]
fn nesting_limit() {
    // 1001 levels of array nesting is one too many
    let mut deep = b"*1\r\n".repeat(1001);
    deep.extend_from_slice(b":1\r\n");
    assert_eq!(
        decode(&deep).unwrap_err(),
        ParseError::TooDeeplyNestedAggregatedTypes
    );
    // exactly 1000 levels is fine
    let mut ok = b"*1\r\n".repeat(1000);
    ok.extend_from_slice(b":1\r\n");
    assert!(decode(&ok).unwrap().is_some());
}

// only a complete value consumes bytes

#[test]
fn consumed_reflects_one_value() {
    let (_, consumed) = decoded(b"+OK\r\n+NEXT\r\n");
    assert_eq!(consumed, 5);
}

// encoder

#[test]
fn encode_forms() {
    let cases: Vec<(Resp2Value, &[u8])> = vec![
        (Resp2Value::simple("OK"), b"+OK\r\n"),
        (Resp2Value::Integer(-7), b":-7\r\n"),
        (Resp2Value::null_bulk(), b"$-1\r\n"),
        (Resp2Value::bulk(""), b"$0\r\n\r\n"),
        (Resp2Value::Array(None), b"*-1\r\n"),
        (Resp2Value::Array(Some(vec![])), b"*0\r\n"),
    ];
    for (value, expected) in cases {
        let mut out = Vec::new();
        encode(&value, &mut out);
        assert_eq!(out, expected, "encoding {value:?}");
    }
}

#[test]
fn roundtrip() {
    let values = vec![
        Resp2Value::simple("PONG"),
        Resp2Value::Error(bytes::Bytes::from_static(b"ERR nope")),
        Resp2Value::Integer(i64::MIN),
        Resp2Value::Integer(i64::MAX),
        Resp2Value::bulk(b"binary\r\n\x00payload"),
        Resp2Value::null_bulk(),
        Resp2Value::Array(None),
        Resp2Value::Array(Some(vec![
            Resp2Value::bulk("a"),
            Resp2Value::Array(Some(vec![Resp2Value::Integer(1), Resp2Value::null_bulk()])),
            Resp2Value::simple("tail"),
        ])),
    ];
    for value in values {
        let mut out = Vec::new();
        encode(&value, &mut out);
        let (back, consumed) = decoded(&out);
        assert_eq!(back, value);
        assert_eq!(consumed, out.len());
    }
}
