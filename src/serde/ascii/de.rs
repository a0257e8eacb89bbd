use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::{i64, space0, space1},
    combinator::{eof, opt, peek, value},
    sequence::terminated,
};

use serde::de::{self, DeserializeSeed, EnumAccess, IntoDeserializer, VariantAccess, Visitor};
use serde::{Deserialize, forward_to_deserialize_any};

use super::error::{Error, Result};

/// Reads one `KEY value` line into an enum whose variants each wrap a
/// single integer or boolean.
pub struct Deserializer<'de> {
    input: &'de str,
}

pub fn from_str<'a, T>(s: &'a str) -> Result<T>
where
    T: Deserialize<'a>,
{
    let mut deserializer = Deserializer { input: s };
    let t = T::deserialize(&mut deserializer)?;
    if deserializer.input.trim_end().is_empty() {
        Ok(t)
    } else {
        Err(Error::TrailingCharacters(s.to_owned()))
    }
}

impl<'de> Deserializer<'de> {
    fn parse<O, P>(&mut self, mut parser: P) -> Result<O>
    where
        P: FnMut(&'de str) -> nom::IResult<&'de str, O, nom::error::Error<&'de str>>,
    {
        let input = self.input;
        let (input, _) = space0(input)?;
        let (input, value) = parser(input)?;
        self.input = input;
        Ok(value)
    }

    // Keys and values only match as whole words, so that one key is never
    // mistaken for a prefix of another and "10" is not read as a boolean.
    fn word<O, P>(&mut self, parser: P) -> Result<O>
    where
        P: FnMut(&'de str) -> nom::IResult<&'de str, O, nom::error::Error<&'de str>>,
    {
        self.parse(terminated(parser, peek(alt((space1, eof)))))
    }

    fn keyword(&mut self, keyword: &'static str) -> Result<bool> {
        let key = terminated(tag(keyword), peek(alt((space1, eof))));
        Ok(self.parse(opt(key))?.is_some())
    }

    fn unsupported(&self) -> Error {
        Error::Unsupported(self.input.to_owned())
    }
}

impl<'de> de::Deserializer<'de> for &mut Deserializer<'de> {
    type Error = Error;

    // Settings only hold integers and booleans. Everything else is rejected
    // through deserialize_any.
    forward_to_deserialize_any! {
        i8 i16 i32 u8 u16 u32 u64 f32 f64 char str string bytes byte_buf option
        unit unit_struct newtype_struct seq tuple tuple_struct map struct
        identifier ignored_any
    }

    fn deserialize_any<V>(self, _visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.unsupported())
    }

    fn deserialize_bool<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let flag = alt((
            value(true, tag_no_case("true")),
            value(false, tag_no_case("false")),
            value(true, tag("1")),
            value(false, tag("0")),
        ));
        visitor.visit_bool(self.word(flag)?)
    }

    fn deserialize_i64<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_i64(self.word(i64)?)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_enum(KeyValue { de: self, variants })
    }
}

// The key of a line selects the variant; its value fills the variant.
struct KeyValue<'a, 'de: 'a> {
    de: &'a mut Deserializer<'de>,
    variants: &'static [&'static str],
}

impl<'de> EnumAccess<'de> for KeyValue<'_, 'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: DeserializeSeed<'de>,
    {
        for variant in self.variants {
            if self.de.keyword(*variant)? {
                let key = <&str as IntoDeserializer<'de, Error>>::into_deserializer(*variant);
                return Ok((seed.deserialize(key)?, self));
            }
        }
        Err(Error::ExpectedEnum(self.de.input.to_owned()))
    }
}

impl<'de> VariantAccess<'de> for KeyValue<'_, 'de> {
    type Error = Error;

    // A key without a value.
    fn unit_variant(self) -> Result<()> {
        Err(self.de.unsupported())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(self.de)
    }

    fn tuple_variant<V>(self, _len: usize, _visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.de.unsupported())
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], _visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.de.unsupported())
    }
}
