use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitStr, parse_macro_input};

/// How a struct field maps onto the stored entity.
enum Role {
    PartitionKey,
    RowKey,
    Timestamp,
    ETag,
    Property(String),
    Skip,
}

struct MappedField<'a> {
    ident: &'a Ident,
    role: Role,
}

fn field_role(field: &syn::Field) -> syn::Result<Role> {
    let ident = field
        .ident
        .as_ref()
        .ok_or_else(|| syn::Error::new_spanned(field, "TableEntity needs named fields"))?;
    let mut role = None;
    let mut set = |next: Role, attr: &syn::Attribute| {
        if role.is_some() {
            return Err(syn::Error::new_spanned(attr, "a field can have only one mapping attribute"));
        }
        role = Some(next);
        Ok(())
    };

    for attr in &field.attrs {
        if attr.path().is_ident("partition_key") {
            set(Role::PartitionKey, attr)?;
        } else if attr.path().is_ident("row_key") {
            set(Role::RowKey, attr)?;
        } else if attr.path().is_ident("timestamp") {
            set(Role::Timestamp, attr)?;
        } else if attr.path().is_ident("etag") {
            set(Role::ETag, attr)?;
        } else if attr.path().is_ident("property") {
            let mut name = None;
            let mut skip = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let lit: LitStr = meta.value()?.parse()?;
                    name = Some(lit.value());
                    Ok(())
                } else if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `name = \"...\"` or `skip`"))
                }
            })?;
            if skip {
                set(Role::Skip, attr)?;
            } else {
                set(Role::Property(name.unwrap_or_else(|| ident.to_string())), attr)?;
            }
        }
    }
    Ok(role.unwrap_or_else(|| Role::Property(ident.to_string())))
}

fn single<'a>(
    fields: &[MappedField<'a>],
    pick: fn(&Role) -> bool,
    attr: &str,
) -> syn::Result<Option<&'a Ident>> {
    let mut found = fields.iter().filter(|f| pick(&f.role));
    let first = found.next().map(|f| f.ident);
    if let Some(extra) = found.next() {
        return Err(syn::Error::new_spanned(
            extra.ident,
            format!("only one field can be marked #[{attr}]"),
        ));
    }
    Ok(first)
}

fn table_name(input: &DeriveInput) -> syn::Result<String> {
    let mut name = input.ident.to_string();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("table")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let lit: LitStr = meta.value()?.parse()?;
                name = lit.value();
                Ok(())
            } else {
                Err(meta.error("expected `name = \"...\"`"))
            }
        })?;
    }
    Ok(name)
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;
    let vis = &input.vis;
    let columns_struct_name = format_ident!("__{}Columns__", struct_name);

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "TableEntity cannot be derived for generic types",
        ));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(struct_name, "TableEntity can only be derived for structs"));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new_spanned(struct_name, "TableEntity needs named fields"));
    };

    let fields = named
        .named
        .iter()
        .map(|field| {
            Ok(MappedField {
                ident: field.ident.as_ref().ok_or_else(|| {
                    syn::Error::new_spanned(field, "TableEntity needs named fields")
                })?,
                role: field_role(field)?,
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    let partition_key = single(&fields, |r| matches!(r, Role::PartitionKey), "partition_key")?.ok_or_else(
        || syn::Error::new(Span::call_site(), "TableEntity needs a #[partition_key] field"),
    )?;
    let row_key = single(&fields, |r| matches!(r, Role::RowKey), "row_key")?
        .ok_or_else(|| syn::Error::new(Span::call_site(), "TableEntity needs a #[row_key] field"))?;
    let timestamp = single(&fields, |r| matches!(r, Role::Timestamp), "timestamp")?;
    let etag = single(&fields, |r| matches!(r, Role::ETag), "etag")?;

    let table_name = table_name(&input)?;

    let timestamp_impl = match timestamp {
        Some(field) => quote! { self.#field },
        None => quote! { ::core::option::Option::None },
    };
    let etag_impl = match etag {
        Some(field) => quote! { self.#field.as_deref() },
        None => quote! { ::core::option::Option::None },
    };

    let properties = fields
        .iter()
        .filter_map(|f| match &f.role {
            Role::Property(name) => Some((f.ident, name.as_str())),
            _ => None,
        })
        .collect::<Vec<_>>();

    let writes = properties.iter().map(|(field, name)| {
        quote! {
            record.insert(
                #name,
                ::table_repo::IntoProperty::into_property(::core::clone::Clone::clone(&self.#field)),
            );
        }
    });

    let reads = fields.iter().map(|f| {
        let field = f.ident;
        match &f.role {
            Role::PartitionKey => {
                quote! { #field: ::core::mem::take(&mut record.partition_key) }
            }
            Role::RowKey => quote! { #field: ::core::mem::take(&mut record.row_key) },
            Role::Timestamp => quote! { #field: record.timestamp },
            Role::ETag => quote! { #field: record.etag.take() },
            Role::Property(name) => quote! {
                #field: ::table_repo::FromProperty::from_property(#name, record.take(#name))?
            },
            Role::Skip => quote! { #field: ::core::default::Default::default() },
        }
    });

    let column_methods = fields.iter().filter_map(|f| {
        let field = f.ident;
        let column = match &f.role {
            Role::PartitionKey => quote! { ::table_repo::Column::partition_key() },
            Role::RowKey => quote! { ::table_repo::Column::row_key() },
            Role::Timestamp => quote! { ::table_repo::Column::timestamp() },
            Role::Property(name) => quote! { ::table_repo::Column::new(#name) },
            Role::ETag | Role::Skip => return None,
        };
        Some(quote! {
            pub fn #field(&self) -> ::table_repo::Column {
                #column
            }
        })
    });

    Ok(quote! {
        impl ::table_repo::TableEntity for #struct_name {
            fn table_name() -> &'static str {
                #table_name
            }

            fn partition_key(&self) -> &str {
                &self.#partition_key
            }

            fn row_key(&self) -> &str {
                &self.#row_key
            }

            fn set_partition_key(&mut self, partition_key: ::std::string::String) {
                self.#partition_key = partition_key;
            }

            fn set_row_key(&mut self, row_key: ::std::string::String) {
                self.#row_key = row_key;
            }

            fn timestamp(&self) -> ::core::option::Option<::table_repo::__private::DateTime<::table_repo::__private::Utc>> {
                #timestamp_impl
            }

            fn etag(&self) -> ::core::option::Option<&str> {
                #etag_impl
            }

            fn to_record(&self) -> ::table_repo::EntityRecord {
                let mut record = ::table_repo::EntityRecord::new(
                    ::core::clone::Clone::clone(&self.#partition_key),
                    ::core::clone::Clone::clone(&self.#row_key),
                );
                #(#writes)*
                record
            }

            fn from_record(
                mut record: ::table_repo::EntityRecord,
            ) -> ::core::result::Result<Self, ::table_repo::Error> {
                ::core::result::Result::Ok(Self {
                    #(#reads),*
                })
            }
        }

        #[doc(hidden)]
        #vis struct #columns_struct_name;

        impl #columns_struct_name {
            #(#column_methods)*
        }

        impl #struct_name {
            /// Filter columns named after this entity's fields.
            #vis fn columns() -> #columns_struct_name {
                #columns_struct_name
            }
        }

        ::table_repo::inventory::submit! {
            ::table_repo::EntityTableMeta {
                type_path: concat!(module_path!(), "::", stringify!(#struct_name)),
                table_name: #table_name,
            }
        }
    })
}

/// Implements `TableEntity` for a struct with named fields.
///
/// Field attributes: `#[partition_key]` and `#[row_key]` (required, `String`),
/// `#[timestamp]` (`Option<DateTime<Utc>>`), `#[etag]` (`Option<String>`),
/// `#[property(name = "...")]` to rename a stored property and
/// `#[property(skip)]` to leave a field out (it must implement `Default`).
/// `#[table(name = "...")]` on the struct overrides the table name.
#[proc_macro_derive(TableEntity, attributes(partition_key, row_key, timestamp, etag, property, table))]
pub fn derive_table_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
